//! Collaborator contracts for user interaction and progress reporting.
//!
//! The SSH worker never talks to a terminal or window directly. Trust and
//! credential questions go through [`InteractivePromptService`], progress
//! through [`ProgressSink`]. [`PromptBridge`] lets a worker thread block on
//! answers that are produced by whichever thread owns user interaction.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Host key information presented for a trust decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostKeyInfo {
    pub host: String,
    pub key_type: String,
    pub key_bits: u32,
    pub fingerprint: String,
}

/// Answers trust and credential questions. Both calls are synchronous and
/// must eventually return.
pub trait InteractivePromptService: Send + Sync {
    fn confirm_trust(&self, key: &HostKeyInfo) -> bool;

    fn answer_challenge(&self, client_type: &str, prompt: &str) -> String;
}

/// Receives progress and answers the cooperative cancellation query.
pub trait ProgressSink: Send + Sync {
    fn report(&self, percent: u8, text: &str);

    fn is_cancellation_requested(&self) -> bool;
}

/// A question sent from the worker to the interaction thread
#[derive(Debug)]
pub enum PromptRequest {
    ConfirmTrust {
        key: HostKeyInfo,
        reply: oneshot::Sender<bool>,
    },
    Challenge {
        client_type: String,
        prompt: String,
        reply: oneshot::Sender<String>,
    },
}

/// Worker-side end of the prompt channel.
///
/// Each call sends a request and blocks the calling (non-async) thread until
/// the interaction thread replies. If the other side has gone away the
/// question resolves to "deny" / empty answer instead of hanging.
#[derive(Clone)]
pub struct PromptBridge {
    tx: mpsc::UnboundedSender<PromptRequest>,
}

impl PromptBridge {
    /// Create a bridge and the receiver the interaction thread serves.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PromptRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl InteractivePromptService for PromptBridge {
    fn confirm_trust(&self, key: &HostKeyInfo) -> bool {
        let (reply, answer) = oneshot::channel();
        let request = PromptRequest::ConfirmTrust {
            key: key.clone(),
            reply,
        };
        if self.tx.send(request).is_err() {
            tracing::warn!("Prompt service gone, refusing host key for {}", key.host);
            return false;
        }
        answer.blocking_recv().unwrap_or(false)
    }

    fn answer_challenge(&self, client_type: &str, prompt: &str) -> String {
        let (reply, answer) = oneshot::channel();
        let request = PromptRequest::Challenge {
            client_type: client_type.to_string(),
            prompt: prompt.to_string(),
            reply,
        };
        if self.tx.send(request).is_err() {
            tracing::warn!("Prompt service gone, answering challenge with empty text");
            return String::new();
        }
        answer.blocking_recv().unwrap_or_default()
    }
}

/// Serve one request with a synchronous prompt service. Dropped replies are
/// fine: the worker already treats them as a refusal.
pub fn answer_request(service: &dyn InteractivePromptService, request: PromptRequest) {
    match request {
        PromptRequest::ConfirmTrust { key, reply } => {
            let _ = reply.send(service.confirm_trust(&key));
        }
        PromptRequest::Challenge {
            client_type,
            prompt,
            reply,
        } => {
            let _ = reply.send(service.answer_challenge(&client_type, &prompt));
        }
    }
}

/// Progress sink that logs each report and exposes a shared cancel flag.
#[derive(Clone, Default)]
pub struct LoggingProgress {
    cancelled: Arc<AtomicBool>,
}

impl LoggingProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

impl ProgressSink for LoggingProgress {
    fn report(&self, percent: u8, text: &str) {
        tracing::info!("[{:>3}%] {}", percent, text);
    }

    fn is_cancellation_requested(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Line-oriented prompts on a terminal (or any reader/writer pair).
///
/// Questions go to `output`, answers are read one line at a time from
/// `input`. End of input denies trust and answers with empty text.
pub struct TerminalPrompter {
    input: Mutex<Box<dyn BufRead + Send>>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl TerminalPrompter {
    pub fn new(input: Box<dyn BufRead + Send>, output: Box<dyn Write + Send>) -> Self {
        Self {
            input: Mutex::new(input),
            output: Mutex::new(output),
        }
    }

    /// Prompt on stderr, read from stdin
    pub fn stdio() -> Self {
        Self::new(
            Box::new(std::io::BufReader::new(std::io::stdin())),
            Box::new(std::io::stderr()),
        )
    }

    /// Print `question` and read one line, without the line ending
    pub fn ask(&self, question: &str) -> Option<String> {
        {
            let mut output = self.output.lock();
            let _ = write!(output, "{}", question);
            let _ = output.flush();
        }

        let mut line = String::new();
        match self.input.lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim_end_matches(['\r', '\n']).to_string()),
        }
    }
}

impl InteractivePromptService for TerminalPrompter {
    fn confirm_trust(&self, key: &HostKeyInfo) -> bool {
        let question = format!(
            "The authenticity of host '{}' can't be established.\n\
             {} key ({} bits) fingerprint is {}.\n\
             Trust this host and remember its key? [y/N] ",
            key.host, key.key_type, key.key_bits, key.fingerprint
        );
        self.ask(&question).is_some_and(|answer| is_yes(&answer))
    }

    fn answer_challenge(&self, client_type: &str, prompt: &str) -> String {
        self.ask(&format!("[{}] {} ", client_type, prompt.trim_end()))
            .unwrap_or_default()
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Fixed;

    impl InteractivePromptService for Fixed {
        fn confirm_trust(&self, key: &HostKeyInfo) -> bool {
            key.host == "trusted.example.org"
        }

        fn answer_challenge(&self, client_type: &str, prompt: &str) -> String {
            format!("{}|{}", client_type, prompt)
        }
    }

    fn key(host: &str) -> HostKeyInfo {
        HostKeyInfo {
            host: host.to_string(),
            key_type: "ssh-ed25519".to_string(),
            key_bits: 256,
            fingerprint: "SHA256:abc".to_string(),
        }
    }

    #[test]
    fn bridge_round_trips_answers_across_threads() {
        let (bridge, mut rx) = PromptBridge::channel();

        let worker = thread::spawn(move || {
            let trusted = bridge.confirm_trust(&key("trusted.example.org"));
            let answer = bridge.answer_challenge("cluster-access", "OTP code:");
            (trusted, answer)
        });

        while let Some(request) = rx.blocking_recv() {
            answer_request(&Fixed, request);
        }

        let (trusted, answer) = worker.join().unwrap();
        assert!(trusted);
        assert_eq!(answer, "cluster-access|OTP code:");
    }

    #[test]
    fn dropped_receiver_denies_instead_of_hanging() {
        let (bridge, rx) = PromptBridge::channel();
        drop(rx);
        assert!(!bridge.confirm_trust(&key("h")));
        assert_eq!(bridge.answer_challenge("c", "p"), "");
    }

    #[test]
    fn dropped_reply_denies() {
        let (bridge, mut rx) = PromptBridge::channel();
        let worker = thread::spawn(move || bridge.confirm_trust(&key("h")));
        if let Some(request) = rx.blocking_recv() {
            drop(request);
        }
        assert!(!worker.join().unwrap());
    }

    #[test]
    fn logging_progress_cancel_flag() {
        let progress = LoggingProgress::new();
        assert!(!progress.is_cancellation_requested());
        progress.cancel_flag().store(true, Ordering::SeqCst);
        assert!(progress.is_cancellation_requested());
    }

    fn scripted(input: &str) -> TerminalPrompter {
        TerminalPrompter::new(
            Box::new(std::io::Cursor::new(input.to_string().into_bytes())),
            Box::new(std::io::sink()),
        )
    }

    #[test]
    fn terminal_trust_needs_explicit_yes() {
        let prompter = scripted("yes\n\nn\n Y \r\n");
        assert!(prompter.confirm_trust(&key("h")));
        assert!(!prompter.confirm_trust(&key("h")));
        assert!(!prompter.confirm_trust(&key("h")));
        assert!(prompter.confirm_trust(&key("h")));
        // input exhausted
        assert!(!prompter.confirm_trust(&key("h")));
    }

    #[test]
    fn terminal_challenge_strips_line_ending() {
        let prompter = scripted("123456\r\n");
        assert_eq!(prompter.answer_challenge("hpc", "Token:"), "123456");
        assert_eq!(prompter.answer_challenge("hpc", "Token:"), "");
    }
}
