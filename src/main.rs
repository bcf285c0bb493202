use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cluster_access::config::commands::{self as profile_cmd, NewProfile, SecretKind};
use cluster_access::config::{self, AppSettings, ProfileManager};
use cluster_access::job::commands::{self as job_cmd, CliContext};
use cluster_access::job::{JobOutcome, JobRequest};
use cluster_access::keychain::{KeyringStore, MemoryStore, SecretStore};
use cluster_access::logging;
use cluster_access::prompt::TerminalPrompter;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "cluster-access")]
#[command(version, about = "Deploy and launch jobs on remote compute clusters over SSH")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Profiles directory (defaults to the configured one)
    #[arg(long, env = "CLUSTER_ACCESS_PROFILES", global = true)]
    profiles_dir: Option<PathBuf>,

    /// Keep secrets for this run only instead of using the OS keychain
    #[arg(long, global = true)]
    no_keychain: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage remote profiles
    #[command(subcommand)]
    Profiles(ProfileCommands),

    /// Stage a job directory, upload scripts and files, and launch the job
    Deploy {
        /// Profile ID
        id: u32,

        /// Job name, created under the profile workspace
        job: String,

        /// Extra local file to upload into the job directory (repeatable)
        #[arg(long = "file", value_name = "PATH")]
        files: Vec<PathBuf>,

        /// Upload only, do not run the launch command
        #[arg(long)]
        no_launch: bool,
    },

    /// Run one command in the remote home directory
    Exec {
        /// Profile ID
        id: u32,

        /// Command line to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// List all profiles
    List,

    /// Print one profile as JSON
    Show { id: u32 },

    /// Create a profile
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        host: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        port: Option<u16>,
        /// Private key file; enables public key authentication
        #[arg(long)]
        key: Option<String>,
        /// Remote workspace, relative to the home directory unless absolute
        #[arg(long)]
        workspace: Option<String>,
    },

    /// Delete a profile and its stored secrets
    Delete { id: u32 },

    /// Forget the pinned host key so the next connection asks again
    ForgetHost { id: u32 },

    /// Store a password or key passphrase in the keychain (empty input clears it)
    SetSecret {
        id: u32,
        #[arg(long, value_enum, default_value = "password")]
        kind: SecretKind,
    },
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    let config_dir = config::get_config_dir()?;
    let mut settings = AppSettings::load(&config_dir).context("Failed to load settings")?;
    if cli.verbose {
        settings.logging.filter = "cluster_access=debug,info".to_string();
    }
    if let Err(e) = logging::init(&settings.logging, &config::get_logs_dir()?) {
        eprintln!("warning: logging not initialized: {}", e);
    }

    let profiles_dir = cli
        .profiles_dir
        .clone()
        .unwrap_or_else(|| settings.profiles_dir(&config_dir));
    let mut profiles = ProfileManager::load(&profiles_dir)
        .with_context(|| format!("Failed to load profiles from {}", profiles_dir.display()))?;
    tracing::debug!("Using profiles directory {:?}", profiles_dir);

    let secrets: Arc<dyn SecretStore> = if cli.no_keychain {
        Arc::new(MemoryStore::default())
    } else {
        Arc::new(KeyringStore)
    };
    let prompter = TerminalPrompter::stdio();

    match cli.command {
        Commands::Profiles(command) => {
            run_profile_command(command, &mut profiles, secrets.as_ref(), &prompter)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Deploy {
            id,
            job,
            files,
            no_launch,
        } => {
            let ctx = cli_context(settings, profiles, secrets);
            let request = JobRequest {
                job_name: job,
                files,
                launch: !no_launch,
            };
            Ok(report(job_cmd::deploy(&ctx, &prompter, id, request)?))
        }
        Commands::Exec { id, command } => {
            let ctx = cli_context(settings, profiles, secrets);
            Ok(report(job_cmd::exec(&ctx, &prompter, id, command.join(" "))?))
        }
    }
}

fn cli_context(
    settings: AppSettings,
    profiles: ProfileManager,
    secrets: Arc<dyn SecretStore>,
) -> CliContext {
    CliContext {
        settings,
        profiles: Arc::new(Mutex::new(profiles)),
        secrets,
    }
}

fn run_profile_command(
    command: ProfileCommands,
    profiles: &mut ProfileManager,
    secrets: &dyn SecretStore,
    prompter: &TerminalPrompter,
) -> Result<()> {
    match command {
        ProfileCommands::List => {
            let summaries = profile_cmd::list_profiles(profiles);
            if summaries.is_empty() {
                println!("No profiles in {}", profiles.root().display());
            }
            for summary in summaries {
                println!("{}", summary);
            }
        }
        ProfileCommands::Show { id } => println!("{}", profile_cmd::show_profile(profiles, id)?),
        ProfileCommands::Add {
            name,
            host,
            user,
            port,
            key,
            workspace,
        } => {
            let profile = profile_cmd::add_profile(
                profiles,
                NewProfile {
                    name,
                    host,
                    port,
                    username: user,
                    key_file: key,
                    workspace,
                },
            )?;
            println!(
                "Created profile {:03}; job scripts go in {}",
                profile.id,
                profiles.root().join(profile.dir_name()).display()
            );
        }
        ProfileCommands::Delete { id } => profile_cmd::delete_profile(profiles, secrets, id)?,
        ProfileCommands::ForgetHost { id } => profile_cmd::forget_host(profiles, id)?,
        ProfileCommands::SetSecret { id, kind } => {
            let label = match kind {
                SecretKind::Password => "Password",
                SecretKind::Passphrase => "Key passphrase",
            };
            let secret = prompter
                .ask(&format!("{} for profile {:03}: ", label, id))
                .unwrap_or_default();
            profile_cmd::set_secret(profiles, secrets, id, kind, &secret)?;
        }
    }
    Ok(())
}

/// Print the outcome and map it to the process exit code
fn report(outcome: JobOutcome) -> ExitCode {
    match outcome {
        JobOutcome::Completed { job_dir, output } => {
            print!("{}", output);
            eprintln!("Done: {}", job_dir);
            ExitCode::SUCCESS
        }
        JobOutcome::Failed(report) => {
            eprintln!("{}", report);
            ExitCode::FAILURE
        }
        JobOutcome::Cancelled { stage } => {
            eprintln!("Cancelled before: {}", stage);
            ExitCode::from(130)
        }
    }
}
