use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Permission denied: {path}: {detail}")]
    PermissionDenied { path: String, detail: String },

    #[error("Transfer error: {path}: {detail}")]
    Transfer { path: String, detail: String },

    #[error("Invalid path {path:?}: {reason}")]
    Path { path: String, reason: String },

    #[error("Remote command `{command}` exited with status {exit_code}")]
    CommandExecution {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("Keychain error: {0}")]
    Keychain(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(u32),

    /// The caller broke a documented contract (operation outside the
    /// connected state, duplicate profile ID). Never recovered locally.
    #[error("Contract violation: {0}")]
    Contract(String),
}

/// Stable, user-facing error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    InvalidInput,
    ConnectionError,
    AuthenticationError,
    PermissionError,
    TransferError,
    PathError,
    CommandExecutionError,
    ProgrammerError,
}

impl ErrorCategory {
    pub fn label(&self) -> &'static str {
        match self {
            ErrorCategory::InvalidInput => "Invalid input",
            ErrorCategory::ConnectionError => "Connection error",
            ErrorCategory::AuthenticationError => "Authentication error",
            ErrorCategory::PermissionError => "Permission error",
            ErrorCategory::TransferError => "Transfer error",
            ErrorCategory::PathError => "Path error",
            ErrorCategory::CommandExecutionError => "Command failed",
            ErrorCategory::ProgrammerError => "Internal error",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Structured result shown to the user. `details` is diagnostic text that
/// belongs in the developer log, not in a dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl std::fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category.label(), self.message)
    }
}

impl AppError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::InvalidInput(_)
            | AppError::Keychain(_)
            | AppError::Config(_)
            | AppError::Serialization(_)
            | AppError::ProfileNotFound(_) => ErrorCategory::InvalidInput,
            AppError::Connection(_) => ErrorCategory::ConnectionError,
            AppError::Auth(_) => ErrorCategory::AuthenticationError,
            AppError::PermissionDenied { .. } => ErrorCategory::PermissionError,
            AppError::Transfer { .. } | AppError::Io(_) => ErrorCategory::TransferError,
            AppError::Path { .. } => ErrorCategory::PathError,
            AppError::CommandExecution { .. } => ErrorCategory::CommandExecutionError,
            AppError::Contract(_) => ErrorCategory::ProgrammerError,
        }
    }

    /// Contract violations terminate the job run instead of becoming a report.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Contract(_))
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport::from(self)
    }

    /// Classify a failed SFTP operation on `path`.
    pub fn from_sftp(err: ssh2::Error, path: &str) -> Self {
        let detail = err.message().to_string();
        match err.code() {
            ssh2::ErrorCode::SFTP(code) => match code {
                // NO_SUCH_FILE, NO_SUCH_PATH, NOT_A_DIRECTORY, INVALID_FILENAME
                2 | 10 | 19 | 20 => AppError::Path {
                    path: path.to_string(),
                    reason: sftp_status_text(code).to_string(),
                },
                // PERMISSION_DENIED, WRITE_PROTECT
                3 | 12 => AppError::PermissionDenied {
                    path: path.to_string(),
                    detail: sftp_status_text(code).to_string(),
                },
                // NO_CONNECTION, CONNECTION_LOST
                6 | 7 => AppError::Connection(format!("{}: {}", sftp_status_text(code), path)),
                _ => AppError::Transfer {
                    path: path.to_string(),
                    detail: format!("{} ({})", sftp_status_text(code), detail),
                },
            },
            ssh2::ErrorCode::Session(code) => Self::from_session_code(code, detail),
        }
    }

    /// Classify a failure of the transport itself (handshake, auth, channel).
    pub fn from_session(err: ssh2::Error, context: &str) -> Self {
        match err.code() {
            ssh2::ErrorCode::Session(code) => {
                Self::from_session_code(code, format!("{}: {}", context, err.message()))
            }
            ssh2::ErrorCode::SFTP(_) => AppError::from_sftp(err, context),
        }
    }

    fn from_session_code(code: i32, detail: String) -> Self {
        match code {
            // PASSWORD_EXPIRED, METHOD_NONE, AUTHENTICATION_FAILED, PUBLICKEY_UNVERIFIED
            -15 | -17 | -18 | -19 => AppError::Auth(detail),
            // FILE (local key file unreadable)
            -16 => AppError::InvalidInput(detail),
            _ => AppError::Connection(detail),
        }
    }
}

fn sftp_status_text(code: i32) -> &'static str {
    match code {
        2 => "no such file",
        3 => "permission denied",
        4 => "failure",
        5 => "bad message",
        6 => "no connection",
        7 => "connection lost",
        8 => "operation unsupported",
        10 => "no such path",
        11 => "file already exists",
        12 => "write protected",
        14 => "no space left on device",
        15 => "quota exceeded",
        19 => "not a directory",
        20 => "invalid file name",
        _ => "remote file operation failed",
    }
}

impl From<&AppError> for ErrorReport {
    fn from(err: &AppError) -> Self {
        let (message, details) = match err {
            AppError::InvalidInput(msg) => (msg.clone(), None),
            AppError::Connection(msg) => (
                "Could not connect to the cluster. Check host, port and network, then retry."
                    .to_string(),
                Some(msg.clone()),
            ),
            AppError::Auth(msg) => (
                "Authentication failed. Check user name and credentials.".to_string(),
                Some(msg.clone()),
            ),
            AppError::PermissionDenied { path, detail } => (
                format!("Access denied on remote path {}", path),
                Some(detail.clone()),
            ),
            AppError::Transfer { path, detail } => {
                (format!("Transfer of {} failed", path), Some(detail.clone()))
            }
            AppError::Path { path, reason } => (format!("Bad path {}: {}", path, reason), None),
            AppError::CommandExecution {
                command,
                exit_code,
                stderr,
            } => (
                format!("Remote command exited with status {}", exit_code),
                Some(format!("command: {}\nstderr: {}", command, stderr)),
            ),
            AppError::Keychain(msg) => (
                "Stored credentials could not be read".to_string(),
                Some(msg.clone()),
            ),
            AppError::Config(msg) => ("Invalid configuration".to_string(), Some(msg.clone())),
            AppError::Io(e) => ("Local file operation failed".to_string(), Some(e.to_string())),
            AppError::Serialization(msg) => {
                ("Could not encode data".to_string(), Some(msg.clone()))
            }
            AppError::ProfileNotFound(id) => (format!("Profile {} not found", id), None),
            AppError::Contract(msg) => ("Internal error".to_string(), Some(msg.clone())),
        };

        ErrorReport {
            category: err.category(),
            message,
            details,
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        ErrorReport::from(self).serialize(serializer)
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<keyring::Error> for AppError {
    fn from(err: keyring::Error) -> Self {
        AppError::Keychain(err.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
