use crate::error::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory name prefix; the full name is the prefix plus a 3-digit ID
pub const PROFILE_DIR_PREFIX: &str = "RemoteProfile_";
pub const PROFILE_FILE: &str = "profile.ini";
pub const SUBMIT_SCRIPT_FILE: &str = "submit.sh";
pub const JOB_SCRIPT_FILE: &str = "job.sh";
pub const BUILD_SCRIPT_FILE: &str = "build.sh";

const RECORD_START: &str = "<RemoteProfile>";
const RECORD_END: &str = "</RemoteProfile>";

/// Connection and job layout profile for one cluster account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProfile {
    pub id: u32,
    pub name: String,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default = "default_true")]
    pub with_password: bool,
    #[serde(default = "default_true")]
    pub with_private_key: bool,
    #[serde(default = "default_true")]
    pub with_keyboard_interactive: bool,
    /// Never persisted to the profile record
    #[serde(skip)]
    pub password: String,
    #[serde(default)]
    pub private_key_path: String,
    /// Never persisted to the profile record
    #[serde(skip)]
    pub passphrase: String,
    #[serde(default)]
    pub pinned_fingerprint: String,
    #[serde(default)]
    pub workspace: String,
    #[serde(default = "default_build_dir")]
    pub build_dir: String,
    #[serde(default)]
    pub submit_script: String,
    #[serde(default)]
    pub job_script: String,
    #[serde(default)]
    pub build_script: String,
    /// Ask for missing credentials at run time instead of failing
    #[serde(default = "default_true")]
    pub ask_configured: bool,
}

fn default_port() -> u16 {
    22
}

fn default_build_dir() -> String {
    "build".to_string()
}

fn default_true() -> bool {
    true
}

impl RemoteProfile {
    pub fn new(
        id: u32,
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            host: host.into(),
            port: default_port(),
            username: username.into(),
            with_password: true,
            with_private_key: true,
            with_keyboard_interactive: true,
            password: String::new(),
            private_key_path: String::new(),
            passphrase: String::new(),
            pinned_fingerprint: String::new(),
            workspace: String::new(),
            build_dir: default_build_dir(),
            submit_script: String::new(),
            job_script: String::new(),
            build_script: String::new(),
            ask_configured: true,
        }
    }

    pub fn has_auth_method(&self) -> bool {
        self.with_password || self.with_private_key || self.with_keyboard_interactive
    }

    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    pub fn set_private_key(&mut self, path: impl Into<String>, passphrase: impl Into<String>) {
        self.private_key_path = path.into();
        self.passphrase = passphrase.into();
    }

    pub fn set_pinned_fingerprint(&mut self, fingerprint: impl Into<String>) {
        self.pinned_fingerprint = fingerprint.into();
    }

    pub fn reset_pinned_fingerprint(&mut self) {
        self.pinned_fingerprint.clear();
    }

    /// Name of this profile's directory
    pub fn dir_name(&self) -> String {
        profile_dir_name(self.id)
    }

    /// Render the plain-text persistence record. Secrets are left out.
    pub fn to_record(&self) -> String {
        let yes_no = |b: bool| if b { "yes" } else { "no" };
        let mut out = String::new();
        out.push_str(RECORD_START);
        out.push('\n');
        out.push_str(&format!("Name: {}\n", self.name));
        out.push_str(&format!("Workspace(remote): {}\n", self.workspace));
        out.push_str(&format!("BuildDir(remote): {}\n", self.build_dir));
        out.push_str(&format!("Host: {}\n", self.host));
        out.push_str(&format!("Port: {}\n", self.port));
        out.push_str(&format!("User: {}\n", self.username));
        out.push_str(&format!("WithPassword: {}\n", yes_no(self.with_password)));
        out.push_str(&format!("WithKey: {}\n", yes_no(self.with_private_key)));
        out.push_str(&format!("WithInteractive: {}\n", yes_no(self.with_keyboard_interactive)));
        out.push_str(&format!("KeyFile: {}\n", self.private_key_path));
        out.push_str(&format!("Fingerprint: {}\n", self.pinned_fingerprint));
        out.push_str(&format!("AskConfigured: {}\n", yes_no(self.ask_configured)));
        out.push_str(RECORD_END);
        out.push('\n');
        out
    }

    /// Parse a persistence record. Unknown lines are ignored and missing
    /// keys keep their defaults.
    pub fn from_record(id: u32, content: &str) -> AppResult<Self> {
        let mut profile = RemoteProfile::new(id, "", "", "");
        let mut inside = false;
        let mut seen_block = false;

        for line in content.lines() {
            let line = line.trim();
            if line == RECORD_START {
                inside = true;
                seen_block = true;
                continue;
            }
            if line == RECORD_END {
                inside = false;
                continue;
            }
            if !inside {
                continue;
            }

            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();

            match key.trim() {
                "Name" => profile.name = value.to_string(),
                "Workspace(remote)" => profile.workspace = value.to_string(),
                "BuildDir(remote)" => {
                    if !value.is_empty() {
                        profile.build_dir = value.to_string();
                    }
                }
                "Host" => profile.host = value.to_string(),
                "Port" => {
                    profile.port = value.parse().map_err(|_| {
                        AppError::Config(format!("Invalid port {:?} in profile {}", value, id))
                    })?;
                }
                "User" => profile.username = value.to_string(),
                "WithPassword" => profile.with_password = parse_yes_no(value),
                "WithKey" => profile.with_private_key = parse_yes_no(value),
                "WithInteractive" => profile.with_keyboard_interactive = parse_yes_no(value),
                "KeyFile" => profile.private_key_path = value.to_string(),
                "Fingerprint" => profile.pinned_fingerprint = value.to_string(),
                "AskConfigured" => profile.ask_configured = parse_yes_no(value),
                _ => {}
            }
        }

        if !seen_block {
            return Err(AppError::Config(format!(
                "Profile {} has no {} block",
                id, RECORD_START
            )));
        }

        Ok(profile)
    }
}

fn parse_yes_no(value: &str) -> bool {
    !matches!(value.to_lowercase().as_str(), "no" | "false" | "0")
}

pub fn profile_dir_name(id: u32) -> String {
    format!("{}{:03}", PROFILE_DIR_PREFIX, id)
}

/// Parse the ID out of a profile directory name
pub fn parse_profile_dir_name(name: &str) -> Option<u32> {
    let digits = name.strip_prefix(PROFILE_DIR_PREFIX)?;
    if digits.len() < 3 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Profile manager: one directory per profile under `root`
pub struct ProfileManager {
    profiles: BTreeMap<u32, RemoteProfile>,
    root: PathBuf,
}

impl ProfileManager {
    pub fn load(root: &Path) -> AppResult<Self> {
        let mut profiles = BTreeMap::new();

        if root.exists() {
            for entry in fs::read_dir(root)? {
                let entry = entry?;
                if !entry.file_type()?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let Some(id) = parse_profile_dir_name(&name) else {
                    continue;
                };

                match Self::read_profile_dir(id, &entry.path()) {
                    Ok(profile) => {
                        if profiles.insert(id, profile).is_some() {
                            return Err(AppError::Contract(format!(
                                "Two profile directories share ID {:03}",
                                id
                            )));
                        }
                    }
                    Err(e) => tracing::warn!("Skipping profile directory {}: {}", name, e),
                }
            }
        }

        tracing::debug!("Loaded {} profiles from {:?}", profiles.len(), root);

        Ok(Self {
            profiles,
            root: root.to_path_buf(),
        })
    }

    fn read_profile_dir(id: u32, dir: &Path) -> AppResult<RemoteProfile> {
        let content = fs::read_to_string(dir.join(PROFILE_FILE))?;
        let mut profile = RemoteProfile::from_record(id, &content)?;
        profile.submit_script = read_optional(&dir.join(SUBMIT_SCRIPT_FILE))?;
        profile.job_script = read_optional(&dir.join(JOB_SCRIPT_FILE))?;
        profile.build_script = read_optional(&dir.join(BUILD_SCRIPT_FILE))?;
        Ok(profile)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn list(&self) -> Vec<RemoteProfile> {
        self.profiles.values().cloned().collect()
    }

    pub fn get(&self, id: u32) -> Option<RemoteProfile> {
        self.profiles.get(&id).cloned()
    }

    /// Smallest ID not yet in use, starting at 1
    pub fn next_id(&self) -> u32 {
        (1..)
            .find(|id| !self.profiles.contains_key(id))
            .unwrap_or(1)
    }

    /// Add a new profile. Reusing an existing ID is a caller bug.
    pub fn add(&mut self, profile: RemoteProfile) -> AppResult<()> {
        if self.profiles.contains_key(&profile.id) || self.root.join(profile.dir_name()).exists() {
            return Err(AppError::Contract(format!(
                "Profile directory {} already exists",
                profile.dir_name()
            )));
        }
        self.write_profile_dir(&profile)?;
        self.profiles.insert(profile.id, profile);
        Ok(())
    }

    pub fn update(&mut self, profile: RemoteProfile) -> AppResult<()> {
        if !self.profiles.contains_key(&profile.id) {
            return Err(AppError::ProfileNotFound(profile.id));
        }
        self.write_profile_dir(&profile)?;
        self.profiles.insert(profile.id, profile);
        Ok(())
    }

    /// Persist only the pinned fingerprint of an existing profile
    pub fn pin_fingerprint(&mut self, id: u32, fingerprint: &str) -> AppResult<()> {
        let mut profile = self.get(id).ok_or(AppError::ProfileNotFound(id))?;
        profile.set_pinned_fingerprint(fingerprint);
        tracing::info!("Pinned host key {} for profile {:03}", fingerprint, id);
        self.update(profile)
    }

    pub fn forget_host(&mut self, id: u32) -> AppResult<()> {
        let mut profile = self.get(id).ok_or(AppError::ProfileNotFound(id))?;
        profile.reset_pinned_fingerprint();
        self.update(profile)
    }

    pub fn delete(&mut self, id: u32) -> AppResult<()> {
        let profile = self.profiles.remove(&id).ok_or(AppError::ProfileNotFound(id))?;
        let dir = self.root.join(profile.dir_name());
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn write_profile_dir(&self, profile: &RemoteProfile) -> AppResult<()> {
        let dir = self.root.join(profile.dir_name());
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(PROFILE_FILE), profile.to_record())?;
        fs::write(dir.join(SUBMIT_SCRIPT_FILE), &profile.submit_script)?;
        fs::write(dir.join(JOB_SCRIPT_FILE), &profile.job_script)?;
        fs::write(dir.join(BUILD_SCRIPT_FILE), &profile.build_script)?;
        Ok(())
    }
}

fn read_optional(path: &Path) -> AppResult<String> {
    if path.exists() {
        Ok(fs::read_to_string(path)?)
    } else {
        Ok(String::new())
    }
}
