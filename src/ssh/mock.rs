//! Recording session double for staging, deployment and runner tests.

use super::{RemoteOps, RemoteSession};
use crate::error::{AppError, AppResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

/// One call made against the mock, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Connect,
    CreateDirectory(String),
    Upload { local: String, remote: String, permissions: u32 },
    WriteText { remote: String, contents: String, permissions: u32 },
    Run(String),
    Teardown,
}

pub struct MockRemote {
    pub home: String,
    calls: Arc<Mutex<Vec<RemoteCall>>>,
    existing: Mutex<HashSet<String>>,
    failing_paths: HashMap<String, AppError>,
    exit_codes: HashMap<String, i32>,
    outputs: HashMap<String, String>,
    connect_error: Option<AppError>,
    pin_update: Option<String>,
    connected: bool,
}

impl MockRemote {
    pub fn new(home: &str) -> Self {
        Self {
            home: home.to_string(),
            calls: Arc::new(Mutex::new(Vec::new())),
            existing: Mutex::new(HashSet::new()),
            failing_paths: HashMap::new(),
            exit_codes: HashMap::new(),
            outputs: HashMap::new(),
            connect_error: None,
            pin_update: None,
            connected: false,
        }
    }

    /// Pretend `path` already exists on the remote side
    pub fn with_existing(self, path: &str) -> Self {
        self.existing.lock().insert(path.to_string());
        self
    }

    /// Any write to `path` fails with `error`
    pub fn failing_at(mut self, path: &str, error: AppError) -> Self {
        self.failing_paths.insert(path.to_string(), error);
        self
    }

    pub fn exiting_with(mut self, command: &str, code: i32) -> Self {
        self.exit_codes.insert(command.to_string(), code);
        self
    }

    pub fn with_output(mut self, command: &str, stdout: &str) -> Self {
        self.outputs.insert(command.to_string(), stdout.to_string());
        self
    }

    pub fn failing_connect(mut self, error: AppError) -> Self {
        self.connect_error = Some(error);
        self
    }

    pub fn pinning(mut self, fingerprint: &str) -> Self {
        self.pin_update = Some(fingerprint.to_string());
        self
    }

    /// Shared handle that outlives the mock once it is moved into a runner
    pub fn call_log(&self) -> Arc<Mutex<Vec<RemoteCall>>> {
        Arc::clone(&self.calls)
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    pub fn created_directories(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                RemoteCall::CreateDirectory(path) => Some(path),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: RemoteCall) {
        self.calls.lock().push(call);
    }

    fn check_path(&self, path: &str) -> AppResult<()> {
        match self.failing_paths.get(path) {
            Some(error) => Err(clone_error(error)),
            None => Ok(()),
        }
    }

    fn execute(&self, command: &str) -> AppResult<String> {
        self.record(RemoteCall::Run(command.to_string()));
        match self.exit_codes.get(command) {
            Some(&code) if code != 0 => Err(AppError::CommandExecution {
                command: command.to_string(),
                exit_code: code,
                stderr: format!("{}: failed", command),
            }),
            _ => Ok(self.outputs.get(command).cloned().unwrap_or_default()),
        }
    }
}

/// AppError holds an io::Error variant and so is not Clone
fn clone_error(error: &AppError) -> AppError {
    match error {
        AppError::PermissionDenied { path, detail } => AppError::PermissionDenied {
            path: path.clone(),
            detail: detail.clone(),
        },
        AppError::Path { path, reason } => AppError::Path {
            path: path.clone(),
            reason: reason.clone(),
        },
        AppError::Transfer { path, detail } => AppError::Transfer {
            path: path.clone(),
            detail: detail.clone(),
        },
        AppError::Auth(msg) => AppError::Auth(msg.clone()),
        AppError::InvalidInput(msg) => AppError::InvalidInput(msg.clone()),
        AppError::Contract(msg) => AppError::Contract(msg.clone()),
        other => AppError::Connection(other.to_string()),
    }
}

impl RemoteOps for MockRemote {
    fn home_dir(&self) -> AppResult<String> {
        Ok(self.home.clone())
    }

    fn exists(&self, path: &str) -> AppResult<bool> {
        Ok(self.existing.lock().contains(path))
    }

    fn create_directory(&self, path: &str) -> AppResult<()> {
        self.record(RemoteCall::CreateDirectory(path.to_string()));
        self.check_path(path)?;
        self.existing.lock().insert(path.to_string());
        Ok(())
    }

    fn upload_file(&self, local: &Path, remote: &str, permissions: u32) -> AppResult<()> {
        self.record(RemoteCall::Upload {
            local: local.display().to_string(),
            remote: remote.to_string(),
            permissions,
        });
        self.check_path(remote)
    }

    fn write_text_file(&self, remote: &str, contents: &str, permissions: u32) -> AppResult<()> {
        self.record(RemoteCall::WriteText {
            remote: remote.to_string(),
            contents: contents.to_string(),
            permissions,
        });
        self.check_path(remote)
    }

    fn run_command(&self, command: &str) -> AppResult<()> {
        self.execute(command).map(|_| ())
    }

    fn run_command_silent(&self, command: &str) -> AppResult<String> {
        self.execute(command)
    }
}

impl RemoteSession for MockRemote {
    fn connect(&mut self) -> AppResult<()> {
        self.record(RemoteCall::Connect);
        if let Some(error) = &self.connect_error {
            return Err(clone_error(error));
        }
        self.connected = true;
        Ok(())
    }

    fn take_pin_update(&mut self) -> Option<String> {
        self.pin_update.take()
    }

    fn teardown(&mut self) {
        if self.connected {
            self.connected = false;
            self.record(RemoteCall::Teardown);
        }
    }
}
