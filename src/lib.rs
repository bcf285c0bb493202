//! Remote job deployment over SSH for compute clusters.
//!
//! A [`config::RemoteProfile`] describes one cluster account. A job run
//! builds a [`ssh::TransportSession`] from it, stages the remote directory
//! tree, uploads scripts and input files, and launches the job, all on a
//! worker thread driven by [`job::run_job`].

pub mod config;
pub mod deploy;
pub mod error;
pub mod job;
pub mod keychain;
pub mod logging;
pub mod paths;
pub mod prompt;
pub mod ssh;

pub use error::{AppError, AppResult, ErrorReport};
