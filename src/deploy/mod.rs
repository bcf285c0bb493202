//! Job layout on the remote side and the files written into it.

pub mod stager;

pub use stager::create_directory_tree;

use crate::config::{
    JobSettings, RemoteProfile, BUILD_SCRIPT_FILE, JOB_SCRIPT_FILE, SUBMIT_SCRIPT_FILE,
};
use crate::error::{AppError, AppResult};
use crate::paths::{combine, combine3, is_rooted};
use crate::ssh::RemoteOps;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Resolved remote directories for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLayout {
    pub job_dir: String,
    pub build_dir: String,
}

impl JobLayout {
    /// Workspace is taken from `home` unless rooted; the job directory and
    /// build directory both live inside it.
    pub fn resolve(home: &str, profile: &RemoteProfile, job_name: &str) -> AppResult<Self> {
        validate_job_name(job_name)?;
        Ok(Self {
            job_dir: combine3(home, &profile.workspace, job_name.trim()),
            build_dir: combine3(home, &profile.workspace, &profile.build_dir),
        })
    }
}

/// Job names become a single path component under the workspace
pub fn validate_job_name(job_name: &str) -> AppResult<()> {
    let name = job_name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidInput("Job name is empty".to_string()));
    }
    if is_rooted(name) || name.split('/').any(|segment| segment == "..") {
        return Err(AppError::InvalidInput(format!(
            "Job name {:?} must stay inside the workspace",
            name
        )));
    }
    Ok(())
}

/// Convert CRLF line endings so scripts run under a POSIX shell
pub fn normalize_script(body: &str) -> String {
    body.replace("\r\n", "\n")
}

/// Writes scripts and uploads input files into a staged job layout
pub struct JobDeployer<'a> {
    ops: &'a dyn RemoteOps,
    settings: &'a JobSettings,
}

impl<'a> JobDeployer<'a> {
    pub fn new(ops: &'a dyn RemoteOps, settings: &'a JobSettings) -> Self {
        Self { ops, settings }
    }

    /// submit.sh and job.sh go to the job directory, build.sh to the build
    /// directory. Empty bodies are skipped.
    pub fn write_scripts(&self, profile: &RemoteProfile, layout: &JobLayout) -> AppResult<()> {
        let scripts = [
            (&layout.job_dir, SUBMIT_SCRIPT_FILE, &profile.submit_script),
            (&layout.job_dir, JOB_SCRIPT_FILE, &profile.job_script),
            (&layout.build_dir, BUILD_SCRIPT_FILE, &profile.build_script),
        ];

        for (dir, file_name, body) in scripts {
            if body.trim().is_empty() {
                tracing::debug!("No {} configured, skipping", file_name);
                continue;
            }
            let remote = combine(dir, file_name);
            self.ops.write_text_file(
                &remote,
                &normalize_script(body),
                self.settings.script_permissions,
            )?;
            tracing::info!("Wrote {}", remote);
        }
        Ok(())
    }

    /// Upload one local file into `dir`, keeping its file name
    pub fn upload(&self, local: &Path, dir: &str) -> AppResult<String> {
        let file_name = local
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| {
                AppError::InvalidInput(format!("{} does not name a file", local.display()))
            })?;

        let remote = combine(dir, &file_name);
        self.ops
            .upload_file(local, &remote, self.settings.file_permissions)?;
        tracing::info!("Uploaded {}", remote);
        Ok(remote)
    }
}
