pub mod auth;
pub mod hostkey;
pub mod session;

#[cfg(test)]
pub mod mock;

pub use auth::*;
pub use hostkey::*;
pub use session::*;

use crate::error::AppResult;
use std::path::Path;

/// Remote operations available on a connected session.
///
/// Staging and deployment are written against this trait so they can be
/// driven by a recording test double as well as by [`TransportSession`].
pub trait RemoteOps {
    /// Remote home directory captured at connect time
    fn home_dir(&self) -> AppResult<String>;

    fn exists(&self, path: &str) -> AppResult<bool>;

    /// Create one directory; a no-op when it already exists
    fn create_directory(&self, path: &str) -> AppResult<()>;

    /// Stream a local file to `remote`, then set its permissions
    fn upload_file(&self, local: &Path, remote: &str, permissions: u32) -> AppResult<()>;

    fn write_text_file(&self, remote: &str, contents: &str, permissions: u32) -> AppResult<()>;

    /// Run a command, print its stdout, fail on non-zero exit
    fn run_command(&self, command: &str) -> AppResult<()>;

    /// Run a command and return its stdout instead of printing it
    fn run_command_silent(&self, command: &str) -> AppResult<String>;
}

/// Lifecycle hooks the job runner needs on top of [`RemoteOps`]
pub trait RemoteSession: RemoteOps {
    fn connect(&mut self) -> AppResult<()>;

    /// Fingerprint accepted during connect that the profile must now pin
    fn take_pin_update(&mut self) -> Option<String>;

    /// Release both channels; repeated calls do nothing
    fn teardown(&mut self);
}
