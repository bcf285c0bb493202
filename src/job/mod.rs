//! Staged job submission worker.
//!
//! A job run walks validate → connect → stage → deploy → execute on one
//! session, reporting progress and polling for cancellation before each
//! stage. Expected failures become [`JobOutcome::Failed`]; contract
//! violations propagate as `Err`.

pub mod commands;

use crate::config::{AppSettings, ProfileManager, RemoteProfile};
use crate::deploy::{create_directory_tree, JobDeployer, JobLayout};
use crate::error::{AppError, AppResult, ErrorReport};
use crate::keychain::{resolve_secrets, SecretStore};
use crate::logging::sanitize;
use crate::prompt::{InteractivePromptService, ProgressSink};
use crate::ssh::{RemoteSession, TransportSession};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use uuid::Uuid;

/// What to deploy and whether to launch it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_name: String,
    /// Local files uploaded into the job directory
    #[serde(default)]
    pub files: Vec<PathBuf>,
    /// Run the launch command once everything is in place
    #[serde(default = "default_launch")]
    pub launch: bool,
}

fn default_launch() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Validate,
    Connect,
    Stage,
    Deploy,
    Execute,
}

impl JobStage {
    /// Progress percentage at which the stage starts
    pub fn start_percent(&self) -> u8 {
        match self {
            JobStage::Validate => 0,
            JobStage::Connect => 10,
            JobStage::Stage => 30,
            JobStage::Deploy => 50,
            JobStage::Execute => 80,
        }
    }

    pub fn end_percent(&self) -> u8 {
        match self {
            JobStage::Validate => 10,
            JobStage::Connect => 30,
            JobStage::Stage => 50,
            JobStage::Deploy => 80,
            JobStage::Execute => 100,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobStage::Validate => "Validating profile",
            JobStage::Connect => "Connecting",
            JobStage::Stage => "Creating remote directories",
            JobStage::Deploy => "Uploading job files",
            JobStage::Execute => "Launching job",
        }
    }
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed { job_dir: String, output: String },
    Failed(ErrorReport),
    Cancelled { stage: JobStage },
}

/// Why the stage walk stopped early
enum Stop {
    Cancelled(JobStage),
    Error(AppError),
}

impl From<AppError> for Stop {
    fn from(e: AppError) -> Self {
        Stop::Error(e)
    }
}

/// Everything a job run needs besides the profile and the request
pub struct JobContext<'a> {
    pub settings: &'a AppSettings,
    pub profiles: &'a Mutex<ProfileManager>,
    pub secrets: &'a dyn SecretStore,
    pub prompts: Arc<dyn InteractivePromptService>,
    pub progress: &'a dyn ProgressSink,
}

impl JobContext<'_> {
    fn begin(&self, stage: JobStage) -> Result<(), Stop> {
        if self.progress.is_cancellation_requested() {
            tracing::info!("Cancellation requested before stage: {}", stage);
            return Err(Stop::Cancelled(stage));
        }
        self.progress.report(stage.start_percent(), stage.label());
        Ok(())
    }

    /// Store a fingerprint accepted during connect
    fn persist_pin(&self, profile: &mut RemoteProfile, pin: &str) {
        profile.set_pinned_fingerprint(pin);
        if let Err(e) = self.profiles.lock().pin_fingerprint(profile.id, pin) {
            tracing::error!(
                "Could not persist pinned host key for profile {:03}: {}",
                profile.id,
                e
            );
        }
    }
}

/// Run one job against a session produced by `open`.
///
/// `open` is handed the profile after secrets are resolved; production code
/// passes [`TransportSession::build`].
pub fn run_job<S, F>(
    profile: &mut RemoteProfile,
    request: &JobRequest,
    ctx: &JobContext<'_>,
    open: F,
) -> AppResult<JobOutcome>
where
    S: RemoteSession,
    F: FnOnce(&RemoteProfile) -> AppResult<S>,
{
    let _span = tracing::info_span!("job", run = %Uuid::new_v4()).entered();
    tracing::info!(
        "Starting job {:?} on profile {:03} ({})",
        request.job_name,
        profile.id,
        profile.host
    );

    let result = validate(profile, request, ctx).and_then(|()| {
        let mut session = open(profile)?;
        let result = execute_stages(&mut session, profile, request, ctx);
        session.teardown();
        result
    });

    finish(result, ctx.progress)
}

/// Fill in secrets; prompts here when the profile asks for it
fn prepare(profile: &mut RemoteProfile, ctx: &JobContext<'_>) -> Result<(), Stop> {
    resolve_secrets(
        profile,
        ctx.secrets,
        ctx.prompts.as_ref(),
        &ctx.settings.jobs.client_type,
    )?;
    Ok(())
}

fn validate(
    profile: &mut RemoteProfile,
    request: &JobRequest,
    ctx: &JobContext<'_>,
) -> Result<(), Stop> {
    ctx.begin(JobStage::Validate)?;
    crate::deploy::validate_job_name(&request.job_name)?;
    for file in &request.files {
        if !file.is_file() {
            return Err(AppError::InvalidInput(format!(
                "Input file not found: {}",
                file.display()
            ))
            .into());
        }
    }
    prepare(profile, ctx)
}

fn execute_stages<S: RemoteSession>(
    session: &mut S,
    profile: &mut RemoteProfile,
    request: &JobRequest,
    ctx: &JobContext<'_>,
) -> Result<(String, String), Stop> {
    connect_stage(session, profile, ctx)?;

    ctx.begin(JobStage::Stage)?;
    let home = session.home_dir()?;
    let layout = JobLayout::resolve(&home, profile, &request.job_name)?;
    create_directory_tree(session, &layout.job_dir)?;
    if !profile.build_script.trim().is_empty() {
        create_directory_tree(session, &layout.build_dir)?;
    }

    ctx.begin(JobStage::Deploy)?;
    let deployer = JobDeployer::new(session, &ctx.settings.jobs);
    deployer.write_scripts(profile, &layout)?;
    let total = request.files.len();
    for (index, file) in request.files.iter().enumerate() {
        let target = deployer.upload(file, &layout.job_dir)?;
        ctx.progress
            .report(stage_percent(JobStage::Deploy, index + 1, total), &target);
    }

    ctx.begin(JobStage::Execute)?;
    let output = if request.launch {
        let command = launch_command(&layout.job_dir, &ctx.settings.jobs.launch_command);
        session.run_command_silent(&command)?
    } else {
        tracing::info!("Launch skipped for {}", layout.job_dir);
        String::new()
    };

    Ok((layout.job_dir, output))
}

/// Connect and persist any host key accepted on the way. A key accepted
/// before authentication fails is still persisted.
fn connect_stage<S: RemoteSession>(
    session: &mut S,
    profile: &mut RemoteProfile,
    ctx: &JobContext<'_>,
) -> Result<(), Stop> {
    ctx.begin(JobStage::Connect)?;
    let connected = session.connect();
    if let Some(pin) = session.take_pin_update() {
        ctx.persist_pin(profile, &pin);
    }
    connected?;
    Ok(())
}

fn finish(
    result: Result<(String, String), Stop>,
    progress: &dyn ProgressSink,
) -> AppResult<JobOutcome> {
    match result {
        Ok((job_dir, output)) => {
            progress.report(100, "Done");
            tracing::info!("Finished in {}", job_dir);
            Ok(JobOutcome::Completed { job_dir, output })
        }
        Err(Stop::Cancelled(stage)) => Ok(JobOutcome::Cancelled { stage }),
        Err(Stop::Error(e)) if e.is_fatal() => {
            tracing::error!("Job aborted: {}", e);
            Err(e)
        }
        Err(Stop::Error(e)) => {
            tracing::error!("Job failed: {}", sanitize(&e.to_string()));
            Ok(JobOutcome::Failed(e.report()))
        }
    }
}

/// Linear progress inside a stage's range after `done` of `total` steps
fn stage_percent(stage: JobStage, done: usize, total: usize) -> u8 {
    let (start, end) = (stage.start_percent() as usize, stage.end_percent() as usize);
    if total == 0 {
        return end as u8;
    }
    (start + (end - start) * done.min(total) / total) as u8
}

/// `cd` into the job directory, then run the configured launch command
pub fn launch_command(job_dir: &str, template: &str) -> String {
    format!("cd {} && {}", shell_quote(job_dir), template.trim())
}

/// Single-quote for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Owned inputs for a job run on a worker thread
pub struct JobWorker {
    pub settings: AppSettings,
    pub profiles: Arc<Mutex<ProfileManager>>,
    pub secrets: Arc<dyn SecretStore>,
    pub prompts: Arc<dyn InteractivePromptService>,
    pub progress: Arc<dyn ProgressSink>,
}

impl JobWorker {
    fn context(&self) -> JobContext<'_> {
        JobContext {
            settings: &self.settings,
            profiles: self.profiles.as_ref(),
            secrets: self.secrets.as_ref(),
            prompts: Arc::clone(&self.prompts),
            progress: self.progress.as_ref(),
        }
    }

    /// Run `request` against `profile` on a dedicated thread over a real
    /// SSH session.
    pub fn spawn_job(
        self,
        mut profile: RemoteProfile,
        request: JobRequest,
    ) -> AppResult<JoinHandle<AppResult<JobOutcome>>> {
        let handle = thread::Builder::new()
            .name(format!("job-{:03}", profile.id))
            .spawn(move || {
                let ctx = self.context();
                run_job(&mut profile, &request, &ctx, |p| {
                    TransportSession::build(
                        p,
                        &ctx.settings.jobs.client_type,
                        Arc::clone(&ctx.prompts),
                        ctx.settings.ssh.clone(),
                    )
                })
            })?;
        Ok(handle)
    }

    /// Connect and run a single command, printing its output as it completes
    pub fn spawn_exec(
        self,
        mut profile: RemoteProfile,
        command: String,
    ) -> AppResult<JoinHandle<AppResult<JobOutcome>>> {
        let handle = thread::Builder::new()
            .name(format!("exec-{:03}", profile.id))
            .spawn(move || {
                let ctx = self.context();
                run_exec(&mut profile, &command, &ctx, |p| {
                    TransportSession::build(
                        p,
                        &ctx.settings.jobs.client_type,
                        Arc::clone(&ctx.prompts),
                        ctx.settings.ssh.clone(),
                    )
                })
            })?;
        Ok(handle)
    }
}

/// Connect and run one command in the home directory
pub fn run_exec<S, F>(
    profile: &mut RemoteProfile,
    command: &str,
    ctx: &JobContext<'_>,
    open: F,
) -> AppResult<JobOutcome>
where
    S: RemoteSession,
    F: FnOnce(&RemoteProfile) -> AppResult<S>,
{
    let _span = tracing::info_span!("exec", run = %Uuid::new_v4()).entered();
    tracing::info!("Running `{}` on profile {:03} ({})", command, profile.id, profile.host);

    let result = ctx
        .begin(JobStage::Validate)
        .and_then(|()| {
            if command.trim().is_empty() {
                return Err(AppError::InvalidInput("Command is empty".to_string()).into());
            }
            prepare(profile, ctx)
        })
        .and_then(|()| {
            let mut session = open(profile)?;
            let result = exec_stages(&mut session, profile, command, ctx);
            session.teardown();
            result
        });

    finish(result, ctx.progress)
}

fn exec_stages<S: RemoteSession>(
    session: &mut S,
    profile: &mut RemoteProfile,
    command: &str,
    ctx: &JobContext<'_>,
) -> Result<(String, String), Stop> {
    connect_stage(session, profile, ctx)?;

    ctx.begin(JobStage::Execute)?;
    session.run_command(command)?;
    Ok((session.home_dir()?, String::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::keychain::MemoryStore;
    use crate::prompt::{HostKeyInfo, LoggingProgress};
    use crate::ssh::mock::{MockRemote, RemoteCall};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingPrompts {
        asked: AtomicUsize,
    }

    impl InteractivePromptService for CountingPrompts {
        fn confirm_trust(&self, _key: &HostKeyInfo) -> bool {
            self.asked.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn answer_challenge(&self, _client_type: &str, _prompt: &str) -> String {
            self.asked.fetch_add(1, Ordering::SeqCst);
            String::new()
        }
    }

    #[derive(Default)]
    struct RecordingProgress {
        reports: Mutex<Vec<u8>>,
        cancel_after: Option<usize>,
    }

    impl ProgressSink for RecordingProgress {
        fn report(&self, percent: u8, _text: &str) {
            self.reports.lock().push(percent);
        }

        fn is_cancellation_requested(&self) -> bool {
            matches!(self.cancel_after, Some(n) if self.reports.lock().len() >= n)
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        settings: AppSettings,
        profiles: Mutex<ProfileManager>,
        secrets: MemoryStore,
        prompts: Arc<CountingPrompts>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut manager = ProfileManager::load(dir.path()).unwrap();
            manager.add(profile()).unwrap();
            Self {
                dir,
                settings: AppSettings::default(),
                profiles: Mutex::new(manager),
                secrets: MemoryStore::default(),
                prompts: Arc::new(CountingPrompts::default()),
            }
        }

        fn ctx<'a>(&'a self, progress: &'a dyn ProgressSink) -> JobContext<'a> {
            JobContext {
                settings: &self.settings,
                profiles: &self.profiles,
                secrets: &self.secrets,
                prompts: self.prompts.clone(),
                progress,
            }
        }
    }

    fn profile() -> RemoteProfile {
        let mut p = RemoteProfile::new(1, "cluster", "login.example.org", "alice");
        p.with_private_key = false;
        p.with_keyboard_interactive = false;
        p.password = "pw".into();
        p.pinned_fingerprint = "SHA256:known".into();
        p.ask_configured = false;
        p.submit_script = "sbatch job.sh".into();
        p
    }

    fn request(name: &str) -> JobRequest {
        JobRequest {
            job_name: name.into(),
            files: Vec::new(),
            launch: true,
        }
    }

    #[test]
    fn happy_path_runs_every_stage_without_prompts() {
        let fx = Fixture::new();
        let progress = RecordingProgress::default();
        let mut p = profile();
        let remote = MockRemote::new("/home/alice").with_output(
            "cd '/home/alice/job001/run1' && sh ./submit.sh",
            "Submitted batch job 42\n",
        );

        let outcome =
            run_job(&mut p, &request("job001/run1"), &fx.ctx(&progress), |_| Ok(remote)).unwrap();

        assert_eq!(
            outcome,
            JobOutcome::Completed {
                job_dir: "/home/alice/job001/run1".into(),
                output: "Submitted batch job 42\n".into(),
            }
        );
        assert_eq!(fx.prompts.asked.load(Ordering::SeqCst), 0);
        assert_eq!(*progress.reports.lock(), vec![0, 10, 30, 50, 80, 100]);
    }

    #[test]
    fn staging_issues_one_call_per_level() {
        let fx = Fixture::new();
        let progress = RecordingProgress::default();
        let mut p = profile();
        p.submit_script.clear();
        let mut req = request("job001/run1");
        req.launch = false;

        let remote = MockRemote::new("/home/alice");
        let log = remote.call_log();
        run_job(&mut p, &req, &fx.ctx(&progress), |_| Ok(remote)).unwrap();

        assert_eq!(
            *log.lock(),
            vec![
                RemoteCall::Connect,
                RemoteCall::CreateDirectory("/home/alice/job001".into()),
                RemoteCall::CreateDirectory("/home/alice/job001/run1".into()),
                RemoteCall::Teardown,
            ]
        );
    }

    #[test]
    fn non_zero_exit_is_a_failed_outcome() {
        let fx = Fixture::new();
        let progress = RecordingProgress::default();
        let mut p = profile();
        let remote = MockRemote::new("/home/alice")
            .exiting_with("cd '/home/alice/j' && sh ./submit.sh", 1);

        match run_job(&mut p, &request("j"), &fx.ctx(&progress), |_| Ok(remote)).unwrap() {
            JobOutcome::Failed(report) => {
                assert_eq!(report.category, ErrorCategory::CommandExecutionError)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn failed_command_leaves_session_usable() {
        let remote = MockRemote::new("/home/alice")
            .exiting_with("false", 1)
            .with_output("echo ok", "ok\n");
        let err = crate::ssh::RemoteOps::run_command_silent(&remote, "false").unwrap_err();
        assert_eq!(err.category(), ErrorCategory::CommandExecutionError);
        assert_eq!(
            crate::ssh::RemoteOps::run_command_silent(&remote, "echo ok").unwrap(),
            "ok\n"
        );
    }

    #[test]
    fn cancellation_stops_before_next_stage() {
        let fx = Fixture::new();
        let progress = RecordingProgress {
            cancel_after: Some(2),
            ..Default::default()
        };
        let mut p = profile();
        let remote = MockRemote::new("/home/alice");

        let outcome = run_job(&mut p, &request("j"), &fx.ctx(&progress), |_| Ok(remote)).unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Cancelled {
                stage: JobStage::Stage
            }
        );
    }

    #[test]
    fn cancel_flag_before_start_skips_everything() {
        let fx = Fixture::new();
        let progress = LoggingProgress::new();
        progress.cancel();
        let mut p = profile();
        let mut opened = false;

        let outcome = run_job(&mut p, &request("j"), &fx.ctx(&progress), |_| {
            opened = true;
            Ok(MockRemote::new("/home/alice"))
        })
        .unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Cancelled {
                stage: JobStage::Validate
            }
        );
        assert!(!opened);
    }

    #[test]
    fn accepted_host_key_is_persisted_even_when_later_stage_fails() {
        let fx = Fixture::new();
        let progress = RecordingProgress::default();
        let mut p = profile();
        p.pinned_fingerprint.clear();
        let remote = MockRemote::new("/home/alice")
            .pinning("SHA256:fresh")
            .failing_at(
                "/home/alice/j",
                AppError::PermissionDenied {
                    path: "/home/alice/j".into(),
                    detail: "denied".into(),
                },
            );

        let outcome = run_job(&mut p, &request("j"), &fx.ctx(&progress), |_| Ok(remote)).unwrap();
        assert!(matches!(
            outcome,
            JobOutcome::Failed(ref r) if r.category == ErrorCategory::PermissionError
        ));
        assert_eq!(p.pinned_fingerprint, "SHA256:fresh");

        let reloaded = ProfileManager::load(fx.dir.path()).unwrap();
        assert_eq!(reloaded.get(1).unwrap().pinned_fingerprint, "SHA256:fresh");
    }

    #[test]
    fn connect_failure_is_reported() {
        let fx = Fixture::new();
        let progress = RecordingProgress::default();
        let mut p = profile();
        let remote =
            MockRemote::new("/home/alice").failing_connect(AppError::Auth("rejected".into()));

        let outcome = run_job(&mut p, &request("j"), &fx.ctx(&progress), |_| Ok(remote)).unwrap();
        assert!(matches!(
            outcome,
            JobOutcome::Failed(ref r) if r.category == ErrorCategory::AuthenticationError
        ));
        assert_eq!(p.pinned_fingerprint, "SHA256:known");
    }

    #[test]
    fn host_key_accepted_before_auth_failure_is_persisted() {
        let fx = Fixture::new();
        let progress = RecordingProgress::default();
        let mut p = profile();
        p.pinned_fingerprint.clear();
        let remote = MockRemote::new("/home/alice")
            .pinning("SHA256:accepted")
            .failing_connect(AppError::Auth("rejected".into()));
        let log = remote.call_log();

        let outcome = run_job(&mut p, &request("j"), &fx.ctx(&progress), |_| Ok(remote)).unwrap();
        assert!(matches!(
            outcome,
            JobOutcome::Failed(ref r) if r.category == ErrorCategory::AuthenticationError
        ));
        assert_eq!(p.pinned_fingerprint, "SHA256:accepted");
        assert_eq!(*log.lock(), vec![RemoteCall::Connect]);

        let reloaded = ProfileManager::load(fx.dir.path()).unwrap();
        assert_eq!(reloaded.get(1).unwrap().pinned_fingerprint, "SHA256:accepted");
    }

    #[test]
    fn missing_input_file_fails_validation() {
        let fx = Fixture::new();
        let progress = RecordingProgress::default();
        let mut p = profile();
        let mut req = request("j");
        req.files.push(fx.dir.path().join("missing.dat"));

        let outcome =
            run_job(&mut p, &req, &fx.ctx(&progress), |_| Ok(MockRemote::new("/h"))).unwrap();
        assert!(matches!(
            outcome,
            JobOutcome::Failed(ref r) if r.category == ErrorCategory::InvalidInput
        ));
    }

    #[test]
    fn contract_violation_propagates() {
        let fx = Fixture::new();
        let progress = RecordingProgress::default();
        let mut p = profile();
        let remote = MockRemote::new("/home/alice")
            .failing_connect(AppError::Contract("bad state".into()));

        let err = run_job(&mut p, &request("j"), &fx.ctx(&progress), |_| Ok(remote)).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn files_are_uploaded_with_progress() {
        let fx = Fixture::new();
        let progress = RecordingProgress::default();
        let input = fx.dir.path().join("mesh.dat");
        std::fs::write(&input, b"mesh").unwrap();

        let mut p = profile();
        let mut req = request("j");
        req.files.push(input);
        req.launch = false;

        let outcome = run_job(&mut p, &req, &fx.ctx(&progress), |_| {
            Ok(MockRemote::new("/home/alice"))
        })
        .unwrap();
        assert!(matches!(outcome, JobOutcome::Completed { .. }));
        assert_eq!(*progress.reports.lock(), vec![0, 10, 30, 50, 80, 80, 100]);
    }

    #[test]
    fn exec_runs_in_home() {
        let fx = Fixture::new();
        let progress = RecordingProgress::default();
        let mut p = profile();
        let outcome = run_exec(&mut p, "squeue -u alice", &fx.ctx(&progress), |_| {
            Ok(MockRemote::new("/home/alice"))
        })
        .unwrap();
        assert_eq!(
            outcome,
            JobOutcome::Completed {
                job_dir: "/home/alice".into(),
                output: String::new(),
            }
        );
    }

    #[test]
    fn quoting_survives_single_quotes() {
        assert_eq!(shell_quote("/home/o'neil/j"), r"'/home/o'\''neil/j'");
        assert_eq!(launch_command("/h/j", " sh ./submit.sh "), "cd '/h/j' && sh ./submit.sh");
    }

    #[test]
    fn stage_percent_spans_range() {
        assert_eq!(stage_percent(JobStage::Deploy, 0, 0), 80);
        assert_eq!(stage_percent(JobStage::Deploy, 1, 2), 65);
        assert_eq!(stage_percent(JobStage::Deploy, 2, 2), 80);
    }
}
