use super::{
    compose_auth_methods, AuthMethod, HostTrustVerifier, ReceivedHostKey, RemoteOps, RemoteSession,
};
use crate::config::{RemoteProfile, SshSettings};
use crate::error::{AppError, AppResult};
use crate::logging::sanitize;
use crate::paths::validate_remote_path;
use crate::prompt::InteractivePromptService;
use serde::{Deserialize, Serialize};
use ssh2::{FileStat, HostKeyType, Session as Ssh2Session, Sftp};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Mode used for directories created during staging
const DIRECTORY_MODE: i32 = 0o755;

/// Pause between polls of an exec channel that had nothing to read
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Unbuilt,
    Built,
    Connecting,
    Connected,
    Closed,
    Failed,
}

/// File-transfer channel: its own SSH connection plus the SFTP subsystem
struct TransferChannel {
    sftp: Sftp,
    session: Ssh2Session,
}

/// One job run's connection to one host.
///
/// Holds a command channel and a file-transfer channel, each with its own
/// handshake and host key check. Both are released together by
/// [`TransportSession::teardown`], which also runs on drop.
pub struct TransportSession {
    profile: RemoteProfile,
    settings: SshSettings,
    methods: Vec<AuthMethod>,
    verifier: HostTrustVerifier,
    state: SessionState,
    command: Option<Ssh2Session>,
    transfer: Option<TransferChannel>,
    home_dir: Option<String>,
    pin_update: Option<String>,
}

impl TransportSession {
    /// Validate the profile and compose auth methods. No network I/O.
    pub fn build(
        profile: &RemoteProfile,
        client_type: &str,
        prompts: Arc<dyn InteractivePromptService>,
        settings: SshSettings,
    ) -> AppResult<Self> {
        if profile.host.trim().is_empty() {
            return Err(AppError::InvalidInput("Host address is empty".to_string()));
        }
        if profile.port == 0 {
            return Err(AppError::InvalidInput("Port must be between 1 and 65535".to_string()));
        }

        let methods = compose_auth_methods(profile, client_type, Arc::clone(&prompts))
            .map_err(|e| {
                tracing::warn!("Session build failed for profile {:03}: {}", profile.id, e);
                e
            })?;

        Ok(Self {
            profile: profile.clone(),
            settings,
            methods,
            verifier: HostTrustVerifier::new(prompts),
            state: SessionState::Built,
            command: None,
            transfer: None,
            home_dir: None,
            pin_update: None,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Pinned fingerprint as of now, including any pin made during connect
    pub fn pinned_fingerprint(&self) -> &str {
        &self.profile.pinned_fingerprint
    }

    /// Open the command channel, then the file-transfer channel
    pub fn connect(&mut self) -> AppResult<()> {
        if self.state != SessionState::Built {
            return Err(AppError::Contract(format!(
                "connect() called on a session in state {:?}",
                self.state
            )));
        }

        self.state = SessionState::Connecting;
        tracing::info!(
            "Connecting to {}@{}:{} (profile {:03})",
            self.profile.username,
            self.profile.host,
            self.profile.port,
            self.profile.id
        );

        match self.open_channels() {
            Ok(()) => {
                self.state = SessionState::Connected;
                tracing::info!(
                    "Connected to {} (home {})",
                    self.profile.host,
                    self.home_dir.as_deref().unwrap_or("?")
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    "Connection to {} failed: {}",
                    self.profile.host,
                    sanitize(&e.to_string())
                );
                self.release_channels();
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    fn open_channels(&mut self) -> AppResult<()> {
        let command = self.open_ssh("command")?;
        self.command = Some(command);

        let session = self.open_ssh("transfer")?;
        let sftp = session
            .sftp()
            .map_err(|e| AppError::from_session(e, "Failed to open SFTP"))?;
        let home = sftp
            .realpath(Path::new("."))
            .map_err(|e| AppError::from_session(e, "Failed to resolve remote home directory"))?;
        self.home_dir = Some(home.to_string_lossy().to_string());
        self.transfer = Some(TransferChannel { sftp, session });

        if self.command.is_none() || self.transfer.is_none() {
            return Err(AppError::Connection(
                "Channel did not report itself connected".to_string(),
            ));
        }
        Ok(())
    }

    /// TCP connect, handshake, host key check and authentication
    fn open_ssh(&mut self, label: &str) -> AppResult<Ssh2Session> {
        tracing::debug!("Opening {} channel to {}", label, self.profile.host);

        let tcp = connect_tcp(
            &self.profile.host,
            self.profile.port,
            Duration::from_secs(self.settings.connect_timeout_secs),
        )?;

        let mut session = Ssh2Session::new()
            .map_err(|e| AppError::Connection(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.settings.operation_timeout_ms);

        session
            .handshake()
            .map_err(|e| AppError::from_session(e, &format!("SSH handshake failed [{}]", label)))?;

        if self.settings.keepalive_interval > 0 {
            session.set_keepalive(true, self.settings.keepalive_interval);
        }

        self.verify_host_key(&session)?;
        self.authenticate(&session, label)?;
        Ok(session)
    }

    fn verify_host_key(&mut self, session: &Ssh2Session) -> AppResult<()> {
        let (blob, key_type) = session
            .host_key()
            .ok_or_else(|| AppError::Connection("No host key received".to_string()))?;
        self.apply_trust(blob, key_type)
    }

    /// Check `blob` against the pin and record any newly accepted key
    fn apply_trust(&mut self, blob: &[u8], key_type: HostKeyType) -> AppResult<()> {
        let decision = self.verifier.verify(
            &self.profile.pinned_fingerprint,
            &ReceivedHostKey {
                host: &self.profile.host,
                blob,
                key_type,
            },
        );

        if !decision.trusted {
            return Err(AppError::Connection(format!(
                "Host key of {} was not trusted",
                self.profile.host
            )));
        }

        // Later handshakes in this session compare against the new pin
        if let Some(pin) = decision.pin {
            self.profile.set_pinned_fingerprint(pin.clone());
            self.pin_update = Some(pin);
        }
        Ok(())
    }

    /// Walk the composed methods once, skipping those the server does not offer
    fn authenticate(&self, session: &Ssh2Session, label: &str) -> AppResult<()> {
        let username = self.profile.username.trim();
        let offered = session.auth_methods(username).map(|m| m.to_string()).ok();

        if session.authenticated() {
            return Ok(());
        }

        let mut last_error: Option<AppError> = None;
        for method in &self.methods {
            if let Some(offered) = offered.as_deref() {
                if !offered.split(',').any(|m| m.trim() == method.name()) {
                    tracing::debug!("Server does not offer {} auth, skipping", method.name());
                    continue;
                }
            }

            match method.attempt(session) {
                Ok(()) => {}
                Err(e) => {
                    tracing::debug!("{} auth failed [{}]: {}", method.name(), label, e);
                    last_error = Some(AppError::from_session(e, method.name()));
                }
            }

            if session.authenticated() {
                tracing::info!("Authenticated with {} [{}]", method.name(), label);
                return Ok(());
            }
        }

        match last_error {
            Some(e @ AppError::Connection(_)) => Err(e),
            _ => Err(AppError::Auth(format!(
                "All offered methods rejected for {}@{} (server offers: {})",
                username,
                self.profile.host,
                offered.as_deref().unwrap_or("unknown")
            ))),
        }
    }

    fn command_channel(&self, operation: &str) -> AppResult<&Ssh2Session> {
        self.ensure_connected(operation)?;
        self.command
            .as_ref()
            .ok_or_else(|| AppError::Contract(format!("{}: command channel missing", operation)))
    }

    fn sftp(&self, operation: &str) -> AppResult<&Sftp> {
        self.ensure_connected(operation)?;
        self.transfer
            .as_ref()
            .map(|t| &t.sftp)
            .ok_or_else(|| AppError::Contract(format!("{}: transfer channel missing", operation)))
    }

    fn ensure_connected(&self, operation: &str) -> AppResult<()> {
        if self.state == SessionState::Connected {
            Ok(())
        } else {
            Err(AppError::Contract(format!(
                "{} called while session is {:?}",
                operation, self.state
            )))
        }
    }

    fn set_permissions(&self, remote: &str, permissions: u32) -> AppResult<()> {
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(permissions),
            atime: None,
            mtime: None,
        };
        self.sftp("set_permissions")?
            .setstat(Path::new(remote), stat)
            .map_err(|e| AppError::from_sftp(e, remote))
    }

    fn execute(&self, command: &str) -> AppResult<String> {
        let session = self.command_channel("run_command")?;
        tracing::debug!("Running remote command: {}", command);

        let mut channel = session
            .channel_session()
            .map_err(|e| AppError::from_session(e, "Failed to open exec channel"))?;
        channel
            .exec(command)
            .map_err(|e| AppError::from_session(e, "Failed to start remote command"))?;

        // Non-blocking reads are not bound by the operation timeout
        session.set_blocking(false);
        let drained = drain_streams(&mut channel.stream(0), &mut channel.stderr(), || {
            channel.eof()
        });
        session.set_blocking(true);
        let (stdout, stderr) = drained.map_err(|e| {
            AppError::Connection(format!("Reading output of `{}` failed: {}", command, e))
        })?;

        channel
            .wait_close()
            .map_err(|e| AppError::from_session(e, "Failed to close exec channel"))?;
        let exit_code = channel
            .exit_status()
            .map_err(|e| AppError::from_session(e, "Failed to read exit status"))?;

        let stdout = String::from_utf8_lossy(&stdout).to_string();
        let stderr = String::from_utf8_lossy(&stderr).to_string();

        if exit_code != 0 {
            tracing::warn!(
                "Remote command `{}` exited with {}: {}",
                command,
                exit_code,
                sanitize(stderr.trim())
            );
            return Err(AppError::CommandExecution {
                command: command.to_string(),
                exit_code,
                stderr,
            });
        }

        Ok(stdout)
    }

    /// Release both channels. Safe to call any number of times.
    pub fn teardown(&mut self) {
        let had_channels = self.command.is_some() || self.transfer.is_some();
        self.release_channels();

        if matches!(
            self.state,
            SessionState::Built | SessionState::Connecting | SessionState::Connected
        ) {
            self.state = SessionState::Closed;
        }
        if had_channels {
            tracing::debug!("Session to {} closed", self.profile.host);
        }
    }

    fn release_channels(&mut self) {
        if let Some(TransferChannel { sftp, session }) = self.transfer.take() {
            drop(sftp);
            let _ = session.disconnect(None, "session closed", None);
        }
        if let Some(session) = self.command.take() {
            let _ = session.disconnect(None, "session closed", None);
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl RemoteOps for TransportSession {
    fn home_dir(&self) -> AppResult<String> {
        self.ensure_connected("home_dir")?;
        self.home_dir
            .clone()
            .ok_or_else(|| AppError::Contract("home directory was not captured".to_string()))
    }

    fn exists(&self, path: &str) -> AppResult<bool> {
        let sftp = self.sftp("exists")?;
        validate_remote_path(path)?;
        match sftp.stat(Path::new(path)) {
            Ok(_) => Ok(true),
            // NO_SUCH_FILE / NO_SUCH_PATH
            Err(e) if matches!(e.code(), ssh2::ErrorCode::SFTP(2) | ssh2::ErrorCode::SFTP(10)) => {
                Ok(false)
            }
            Err(e) => Err(AppError::from_sftp(e, path)),
        }
    }

    fn create_directory(&self, path: &str) -> AppResult<()> {
        if self.exists(path)? {
            tracing::debug!("Remote directory exists: {}", path);
            return Ok(());
        }
        self.sftp("create_directory")?
            .mkdir(Path::new(path), DIRECTORY_MODE)
            .map_err(|e| AppError::from_sftp(e, path))?;
        tracing::debug!("Created remote directory {}", path);
        Ok(())
    }

    fn upload_file(&self, local: &Path, remote: &str, permissions: u32) -> AppResult<()> {
        let sftp = self.sftp("upload_file")?;
        validate_remote_path(remote)?;

        let local_name = local.display().to_string();
        let mut source = File::open(local).map_err(|e| match e.kind() {
            ErrorKind::NotFound => AppError::Path {
                path: local_name.clone(),
                reason: "local file not found".to_string(),
            },
            _ => AppError::Transfer {
                path: local_name.clone(),
                detail: e.to_string(),
            },
        })?;

        let mut target = sftp
            .create(Path::new(remote))
            .map_err(|e| AppError::from_sftp(e, remote))?;
        let bytes = std::io::copy(&mut source, &mut target).map_err(|e| AppError::Transfer {
            path: remote.to_string(),
            detail: e.to_string(),
        })?;
        drop(target);

        tracing::debug!("Uploaded {} -> {} ({} bytes)", local_name, remote, bytes);
        self.set_permissions(remote, permissions)
    }

    fn write_text_file(&self, remote: &str, contents: &str, permissions: u32) -> AppResult<()> {
        let sftp = self.sftp("write_text_file")?;
        validate_remote_path(remote)?;
        let mut target = sftp
            .create(Path::new(remote))
            .map_err(|e| AppError::from_sftp(e, remote))?;
        target
            .write_all(contents.as_bytes())
            .map_err(|e| AppError::Transfer {
                path: remote.to_string(),
                detail: e.to_string(),
            })?;
        drop(target);

        tracing::debug!("Wrote {} ({} bytes)", remote, contents.len());
        self.set_permissions(remote, permissions)
    }

    fn run_command(&self, command: &str) -> AppResult<()> {
        let stdout = self.execute(command)?;
        print!("{}", stdout);
        let _ = std::io::stdout().flush();
        Ok(())
    }

    fn run_command_silent(&self, command: &str) -> AppResult<String> {
        self.execute(command)
    }
}

impl RemoteSession for TransportSession {
    fn connect(&mut self) -> AppResult<()> {
        TransportSession::connect(self)
    }

    fn take_pin_update(&mut self) -> Option<String> {
        self.pin_update.take()
    }

    fn teardown(&mut self) {
        TransportSession::teardown(self)
    }
}

/// Read stdout and stderr in turn until the channel reports EOF and both
/// streams are empty
fn drain_streams<O, E, F>(
    out: &mut O,
    err: &mut E,
    at_eof: F,
) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    O: Read,
    E: Read,
    F: Fn() -> bool,
{
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut buf = [0u8; 16 * 1024];

    loop {
        let read_out = read_available(out, &mut buf, &mut stdout)?;
        let read_err = read_available(err, &mut buf, &mut stderr)?;
        if read_out || read_err {
            continue;
        }
        if at_eof() {
            return Ok((stdout, stderr));
        }
        thread::sleep(EXEC_POLL_INTERVAL);
    }
}

/// One non-blocking read into `into`; `true` when bytes arrived
fn read_available<R: Read>(
    stream: &mut R,
    buf: &mut [u8],
    into: &mut Vec<u8>,
) -> std::io::Result<bool> {
    match stream.read(buf) {
        Ok(0) => Ok(false),
        Ok(n) => {
            into.extend_from_slice(&buf[..n]);
            Ok(true)
        }
        Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Resolve `host` and connect to the first address that answers
fn connect_tcp(host: &str, port: u16, timeout: Duration) -> AppResult<TcpStream> {
    let addrs: Vec<SocketAddr> = (host.trim(), port)
        .to_socket_addrs()
        .map_err(|e| AppError::Connection(format!("Cannot resolve {}: {}", host, e)))?
        .collect();

    let mut last_error = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => {
                let _ = tcp.set_nodelay(true);
                return Ok(tcp);
            }
            Err(e) => {
                tracing::debug!("TCP connect to {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(AppError::Connection(format!(
        "TCP connect to {}:{} failed: {}",
        host,
        port,
        last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no addresses".to_string())
    )))
}
