//! `deploy` and `exec` handlers.
//!
//! The SSH work runs on a worker thread; the calling thread answers its
//! trust and challenge questions on the terminal until the worker is done.

use super::{JobOutcome, JobRequest, JobWorker};
use crate::config::{AppSettings, ProfileManager};
use crate::error::{AppError, AppResult};
use crate::keychain::SecretStore;
use crate::prompt::{
    answer_request, InteractivePromptService, LoggingProgress, PromptBridge, PromptRequest,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::UnboundedReceiver;

/// Shared state handed to every job handler
pub struct CliContext {
    pub settings: AppSettings,
    pub profiles: Arc<Mutex<ProfileManager>>,
    pub secrets: Arc<dyn SecretStore>,
}

pub fn deploy(
    ctx: &CliContext,
    prompter: &dyn InteractivePromptService,
    id: u32,
    request: JobRequest,
) -> AppResult<JobOutcome> {
    let profile = ctx.profiles.lock().get(id).ok_or(AppError::ProfileNotFound(id))?;
    run_on_worker(ctx, prompter, |worker| worker.spawn_job(profile, request))
}

pub fn exec(
    ctx: &CliContext,
    prompter: &dyn InteractivePromptService,
    id: u32,
    command: String,
) -> AppResult<JobOutcome> {
    let profile = ctx.profiles.lock().get(id).ok_or(AppError::ProfileNotFound(id))?;
    run_on_worker(ctx, prompter, |worker| worker.spawn_exec(profile, command))
}

fn run_on_worker<F>(
    ctx: &CliContext,
    prompter: &dyn InteractivePromptService,
    spawn: F,
) -> AppResult<JobOutcome>
where
    F: FnOnce(JobWorker) -> AppResult<JoinHandle<AppResult<JobOutcome>>>,
{
    let (bridge, requests) = PromptBridge::channel();
    let progress = LoggingProgress::new();
    let _interrupt = watch_interrupt(progress.clone())?;

    let handle = spawn(JobWorker {
        settings: ctx.settings.clone(),
        profiles: Arc::clone(&ctx.profiles),
        secrets: Arc::clone(&ctx.secrets),
        prompts: Arc::new(bridge),
        progress: Arc::new(progress),
    })?;

    serve_prompts(prompter, requests);

    handle
        .join()
        .map_err(|_| AppError::Contract("job worker panicked".to_string()))?
}

/// Answer worker questions until every bridge handle is dropped
pub fn serve_prompts(
    prompter: &dyn InteractivePromptService,
    mut requests: UnboundedReceiver<PromptRequest>,
) {
    while let Some(request) = requests.blocking_recv() {
        answer_request(prompter, request);
    }
}

/// Ctrl-C requests cancellation before the next stage. The watcher lives as
/// long as the returned runtime.
fn watch_interrupt(progress: LoggingProgress) -> AppResult<tokio::runtime::Runtime> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("interrupt-watch")
        .enable_all()
        .build()?;

    runtime.spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling before the next stage");
            progress.cancel();
        }
    });
    Ok(runtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::HostKeyInfo;
    use std::thread;

    struct Always;

    impl InteractivePromptService for Always {
        fn confirm_trust(&self, _key: &HostKeyInfo) -> bool {
            true
        }

        fn answer_challenge(&self, _client_type: &str, prompt: &str) -> String {
            prompt.to_uppercase()
        }
    }

    #[test]
    fn serve_prompts_returns_once_worker_drops_bridge() {
        let (bridge, requests) = PromptBridge::channel();
        let worker = thread::spawn(move || bridge.answer_challenge("hpc", "otp"));
        serve_prompts(&Always, requests);
        assert_eq!(worker.join().unwrap(), "OTP");
    }

    #[test]
    fn unknown_profile_is_reported_before_spawning() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CliContext {
            settings: AppSettings::default(),
            profiles: Arc::new(Mutex::new(ProfileManager::load(dir.path()).unwrap())),
            secrets: Arc::new(crate::keychain::MemoryStore::default()),
        };
        let request = JobRequest {
            job_name: "j".into(),
            files: Vec::new(),
            launch: false,
        };
        assert!(matches!(
            deploy(&ctx, &Always, 7, request),
            Err(AppError::ProfileNotFound(7))
        ));
        assert!(matches!(
            exec(&ctx, &Always, 7, "true".into()),
            Err(AppError::ProfileNotFound(7))
        ));
    }
}
