//! Trust-on-first-use host key verification.

use crate::prompt::{HostKeyInfo, InteractivePromptService};
use sha2::{Digest, Sha256};
use ssh2::HostKeyType;
use std::sync::Arc;

/// Outcome of one verification. When `pin` is set the caller must store it
/// as the profile's pinned fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustDecision {
    pub trusted: bool,
    pub pin: Option<String>,
}

impl TrustDecision {
    fn refused() -> Self {
        Self {
            trusted: false,
            pin: None,
        }
    }
}

/// Host key as received during a handshake
#[derive(Debug, Clone)]
pub struct ReceivedHostKey<'a> {
    pub host: &'a str,
    pub blob: &'a [u8],
    pub key_type: HostKeyType,
}

pub struct HostTrustVerifier {
    prompts: Arc<dyn InteractivePromptService>,
}

impl HostTrustVerifier {
    pub fn new(prompts: Arc<dyn InteractivePromptService>) -> Self {
        Self { prompts }
    }

    /// Decide whether `key` is trusted given the currently pinned fingerprint.
    ///
    /// A matching pin is trusted silently. Anything else, including a pin
    /// mismatch, goes to the prompt service; acceptance re-pins.
    pub fn verify(&self, pinned: &str, key: &ReceivedHostKey<'_>) -> TrustDecision {
        if key.blob.is_empty() {
            tracing::warn!("Empty host key received from {}", key.host);
            return TrustDecision::refused();
        }

        let fingerprint = compute_sha256_fingerprint(key.blob);

        if !pinned.is_empty() && pinned == fingerprint {
            tracing::debug!("Host key matched pinned fingerprint for {}", key.host);
            return TrustDecision {
                trusted: true,
                pin: None,
            };
        }

        if pinned.is_empty() {
            tracing::info!("Unknown host key for {}: {}", key.host, fingerprint);
        } else {
            tracing::warn!(
                "Host key for {} changed: pinned {} but received {}",
                key.host,
                pinned,
                fingerprint
            );
        }

        let info = HostKeyInfo {
            host: key.host.to_string(),
            key_type: key_type_name(key.blob, key.key_type),
            key_bits: key_bits(key.blob),
            fingerprint: fingerprint.clone(),
        };

        if self.prompts.confirm_trust(&info) {
            tracing::info!("User accepted host key {} for {}", fingerprint, key.host);
            TrustDecision {
                trusted: true,
                pin: Some(fingerprint),
            }
        } else {
            tracing::info!("User rejected host key {} for {}", fingerprint, key.host);
            TrustDecision::refused()
        }
    }
}

/// Compute SHA256 fingerprint of a key
pub fn compute_sha256_fingerprint(key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key);
    let result = hasher.finalize();

    // Format as SHA256:base64
    let b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, result);
    format!("SHA256:{}", b64.trim_end_matches('='))
}

/// Algorithm name, read from the key blob when it parses
pub fn key_type_name(blob: &[u8], key_type: HostKeyType) -> String {
    if let Ok(key) = ssh_key::PublicKey::from_bytes(blob) {
        return key.algorithm().as_str().to_string();
    }

    match key_type {
        HostKeyType::Rsa => "ssh-rsa",
        HostKeyType::Dss => "ssh-dss",
        HostKeyType::Ecdsa256 => "ecdsa-sha2-nistp256",
        HostKeyType::Ecdsa384 => "ecdsa-sha2-nistp384",
        HostKeyType::Ecdsa521 => "ecdsa-sha2-nistp521",
        _ => "unknown",
    }
    .to_string()
}

/// Key size in bits. Unparseable blobs report their raw size.
pub fn key_bits(blob: &[u8]) -> u32 {
    let Ok(key) = ssh_key::PublicKey::from_bytes(blob) else {
        return (blob.len() * 8) as u32;
    };

    let data = key.key_data();
    if let Some(rsa) = data.rsa() {
        return mpint_bits(rsa.n.as_positive_bytes());
    }
    if let Some(dsa) = data.dsa() {
        return mpint_bits(dsa.p.as_positive_bytes());
    }

    match key.algorithm() {
        ssh_key::Algorithm::Ed25519 | ssh_key::Algorithm::SkEd25519 => 256,
        // "nistp256" / "nistp384" / "nistp521"
        ssh_key::Algorithm::Ecdsa { curve } => curve
            .as_str()
            .trim_start_matches("nistp")
            .parse()
            .unwrap_or(0),
        ssh_key::Algorithm::SkEcdsaSha2NistP256 => 256,
        _ => (blob.len() * 8) as u32,
    }
}

fn mpint_bits(bytes: Option<&[u8]>) -> u32 {
    match bytes {
        Some([first, rest @ ..]) => rest.len() as u32 * 8 + (8 - first.leading_zeros()),
        _ => 0,
    }
}
