//! Profile management handlers behind the `profiles` subcommands.

use super::{ProfileManager, RemoteProfile};
use crate::error::{AppError, AppResult};
use crate::keychain::{passphrase_key, password_key, SecretStore};
use serde::Serialize;
use std::fmt;

/// One line of `profiles list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProfileSummary {
    pub id: u32,
    pub name: String,
    pub target: String,
    pub auth: Vec<&'static str>,
    pub pinned: bool,
}

impl From<&RemoteProfile> for ProfileSummary {
    fn from(profile: &RemoteProfile) -> Self {
        let auth = [
            (profile.with_password, "password"),
            (profile.with_private_key, "publickey"),
            (profile.with_keyboard_interactive, "keyboard-interactive"),
        ]
        .into_iter()
        .filter_map(|(enabled, name)| enabled.then_some(name))
        .collect();

        Self {
            id: profile.id,
            name: profile.name.clone(),
            target: format!("{}@{}:{}", profile.username, profile.host, profile.port),
            auth,
            pinned: !profile.pinned_fingerprint.is_empty(),
        }
    }
}

impl fmt::Display for ProfileSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:03}  {:<20} {:<36} {}{}",
            self.id,
            self.name,
            self.target,
            self.auth.join(","),
            if self.pinned { "" } else { "  (host key not pinned)" }
        )
    }
}

pub fn list_profiles(manager: &ProfileManager) -> Vec<ProfileSummary> {
    manager.list().iter().map(ProfileSummary::from).collect()
}

/// Profile as pretty JSON; secrets are never serialized
pub fn show_profile(manager: &ProfileManager, id: u32) -> AppResult<String> {
    let profile = manager.get(id).ok_or(AppError::ProfileNotFound(id))?;
    Ok(serde_json::to_string_pretty(&profile)?)
}

/// Fields accepted by `profiles add`
#[derive(Debug, Clone, Default)]
pub struct NewProfile {
    pub name: String,
    pub host: String,
    pub port: Option<u16>,
    pub username: String,
    pub key_file: Option<String>,
    pub workspace: Option<String>,
}

/// Create a profile under the next free ID
pub fn add_profile(manager: &mut ProfileManager, new: NewProfile) -> AppResult<RemoteProfile> {
    if new.host.trim().is_empty() {
        return Err(AppError::InvalidInput("Host address is empty".to_string()));
    }

    let mut profile = RemoteProfile::new(
        manager.next_id(),
        new.name,
        new.host.trim(),
        new.username.trim(),
    );
    if let Some(port) = new.port {
        profile.port = port;
    }
    match new.key_file {
        Some(path) => profile.set_private_key(path, ""),
        None => profile.with_private_key = false,
    }
    if let Some(workspace) = new.workspace {
        profile.workspace = workspace;
    }

    manager.add(profile.clone())?;
    tracing::info!("Created profile {:03} for {}", profile.id, profile.host);
    Ok(profile)
}

pub fn delete_profile(
    manager: &mut ProfileManager,
    store: &dyn SecretStore,
    id: u32,
) -> AppResult<()> {
    manager.delete(id)?;
    store.delete_secret(&password_key(id))?;
    store.delete_secret(&passphrase_key(id))?;
    tracing::info!("Deleted profile {:03}", id);
    Ok(())
}

/// Drop the pinned host key so the next connection asks again
pub fn forget_host(manager: &mut ProfileManager, id: u32) -> AppResult<()> {
    manager.forget_host(id)?;
    tracing::info!("Forgot pinned host key for profile {:03}", id);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SecretKind {
    Password,
    Passphrase,
}

pub fn set_secret(
    manager: &ProfileManager,
    store: &dyn SecretStore,
    id: u32,
    kind: SecretKind,
    secret: &str,
) -> AppResult<()> {
    manager.get(id).ok_or(AppError::ProfileNotFound(id))?;
    let key = match kind {
        SecretKind::Password => password_key(id),
        SecretKind::Passphrase => passphrase_key(id),
    };

    if secret.is_empty() {
        store.delete_secret(&key)
    } else {
        store.store_secret(&key, secret)
    }
}
