//! Secret storage for profile credentials.
//!
//! Passwords and key passphrases are never written to the profile record;
//! they live in the OS keychain keyed by profile ID.

use crate::config::RemoteProfile;
use crate::error::AppResult;
use crate::prompt::InteractivePromptService;
use keyring::Entry;
use parking_lot::Mutex;
use std::collections::HashMap;

const SERVICE_NAME: &str = "cluster-access";

pub fn password_key(profile_id: u32) -> String {
    format!("password:{:03}", profile_id)
}

pub fn passphrase_key(profile_id: u32) -> String {
    format!("passphrase:{:03}", profile_id)
}

/// Where profile secrets are kept
pub trait SecretStore: Send + Sync {
    fn get_secret(&self, key: &str) -> AppResult<Option<String>>;

    fn store_secret(&self, key: &str, secret: &str) -> AppResult<()>;

    fn delete_secret(&self, key: &str) -> AppResult<()>;
}

/// OS keychain backend
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyringStore;

impl SecretStore for KeyringStore {
    fn get_secret(&self, key: &str) -> AppResult<Option<String>> {
        let entry = Entry::new(SERVICE_NAME, key)?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn store_secret(&self, key: &str, secret: &str) -> AppResult<()> {
        Entry::new(SERVICE_NAME, key)?.set_password(secret)?;
        tracing::debug!("Stored secret in OS keychain: {}", key);
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> AppResult<()> {
        match Entry::new(SERVICE_NAME, key)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Process-local store, used when no keychain is wanted
#[derive(Debug, Default)]
pub struct MemoryStore {
    secrets: Mutex<HashMap<String, String>>,
}

impl SecretStore for MemoryStore {
    fn get_secret(&self, key: &str) -> AppResult<Option<String>> {
        Ok(self.secrets.lock().get(key).cloned())
    }

    fn store_secret(&self, key: &str, secret: &str) -> AppResult<()> {
        self.secrets.lock().insert(key.to_string(), secret.to_string());
        Ok(())
    }

    fn delete_secret(&self, key: &str) -> AppResult<()> {
        self.secrets.lock().remove(key);
        Ok(())
    }
}

/// Fill in the profile's password and passphrase.
///
/// Secrets already set on the profile win. Otherwise the store is consulted,
/// and when the profile asks for it, the user is prompted for what is still
/// missing. A keychain failure is only fatal when nothing can be asked.
pub fn resolve_secrets(
    profile: &mut RemoteProfile,
    store: &dyn SecretStore,
    prompts: &dyn InteractivePromptService,
    client_type: &str,
) -> AppResult<()> {
    if profile.with_password && profile.password.is_empty() {
        match store.get_secret(&password_key(profile.id)) {
            Ok(Some(secret)) => profile.password = secret,
            Ok(None) => {}
            Err(e) if profile.ask_configured => {
                tracing::warn!("Keychain lookup failed for profile {:03}: {}", profile.id, e)
            }
            Err(e) => return Err(e),
        }
        if profile.password.is_empty() && profile.ask_configured {
            let question = format!("Password for {}@{}:", profile.username, profile.host);
            profile.password = prompts.answer_challenge(client_type, &question);
        }
    }

    if profile.with_private_key && profile.passphrase.is_empty() {
        match store.get_secret(&passphrase_key(profile.id)) {
            Ok(Some(secret)) => profile.passphrase = secret,
            Ok(None) => {}
            Err(e) if profile.ask_configured => {
                tracing::warn!("Keychain lookup failed for profile {:03}: {}", profile.id, e)
            }
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
