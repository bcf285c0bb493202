use crate::error::AppResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "settings.toml";

/// Application settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub jobs: JobSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// libssh2 blocking-call timeout, 0 disables it
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u32,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_operation_timeout() -> u32 {
    30_000
}

fn default_keepalive() -> u32 {
    20
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            operation_timeout_ms: default_operation_timeout(),
            keepalive_interval: default_keepalive(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSettings {
    /// Label shown next to keyboard-interactive questions
    #[serde(default = "default_client_type")]
    pub client_type: String,
    #[serde(default = "default_script_permissions")]
    pub script_permissions: u32,
    #[serde(default = "default_file_permissions")]
    pub file_permissions: u32,
    /// Override for the profiles directory (defaults to `<config>/profiles`)
    #[serde(default)]
    pub profiles_dir: Option<PathBuf>,
    /// Command run inside the job directory to launch the job
    #[serde(default = "default_launch_command")]
    pub launch_command: String,
}

fn default_client_type() -> String {
    "cluster-access".to_string()
}

fn default_script_permissions() -> u32 {
    0o755
}

fn default_file_permissions() -> u32 {
    0o644
}

fn default_launch_command() -> String {
    "sh ./submit.sh".to_string()
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            client_type: default_client_type(),
            script_permissions: default_script_permissions(),
            file_permissions: default_file_permissions(),
            profiles_dir: None,
            launch_command: default_launch_command(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
    /// Also append logs to `<config>/logs/cluster-access.log`
    #[serde(default)]
    pub to_file: bool,
}

fn default_log_filter() -> String {
    "cluster_access=info,warn".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            to_file: false,
        }
    }
}

impl AppSettings {
    pub fn load(config_dir: &Path) -> AppResult<Self> {
        let path = config_dir.join(SETTINGS_FILE);
        if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            Ok(toml::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, config_dir: &Path) -> AppResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_dir.join(SETTINGS_FILE), content)?;
        Ok(())
    }

    pub fn profiles_dir(&self, config_dir: &Path) -> PathBuf {
        self.jobs
            .profiles_dir
            .clone()
            .unwrap_or_else(|| config_dir.join("profiles"))
    }
}
