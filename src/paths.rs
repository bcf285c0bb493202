//! Remote path helpers.
//!
//! Remote paths always use `/` separators regardless of the local platform,
//! so they are handled as plain strings rather than `std::path::Path`.

use crate::error::{AppError, AppResult};

/// Longest remote path we are willing to send over SFTP
pub const MAX_REMOTE_PATH_LEN: usize = 4096;

/// True iff the trimmed path is non-empty and starts with `/`.
pub fn is_rooted(path: &str) -> bool {
    path.trim().starts_with('/')
}

/// Trim whitespace, then strip every trailing `/`.
pub fn remove_trailing_slashes(path: &str) -> String {
    path.trim().trim_end_matches('/').to_string()
}

/// Join two remote paths. A rooted right-hand side wins outright.
pub fn combine(a: &str, b: &str) -> String {
    if is_rooted(b) || a.trim().is_empty() {
        return remove_trailing_slashes(b);
    }
    if b.trim().is_empty() {
        return remove_trailing_slashes(a);
    }
    format!(
        "{}/{}",
        remove_trailing_slashes(a),
        remove_trailing_slashes(b)
    )
}

pub fn combine3(a: &str, b: &str, c: &str) -> String {
    combine(a, &combine(b, c))
}

/// Every ancestor of `path`, parents before children.
///
/// `"/a/b/c"` yields `["/a", "/a/b", "/a/b/c"]`.
pub fn directory_list(path: &str) -> Vec<String> {
    let prefix = if is_rooted(path) { "/" } else { "" };
    let mut current = String::new();

    path.trim()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);
            format!("{}{}", prefix, current)
        })
        .collect()
}

/// Reject paths the remote side cannot represent.
pub fn validate_remote_path(path: &str) -> AppResult<()> {
    let reason = if path.trim().is_empty() {
        "path is empty"
    } else if path.len() > MAX_REMOTE_PATH_LEN {
        "path is too long"
    } else if path.contains(['\0', '\r', '\n']) {
        "path contains unsupported characters"
    } else {
        return Ok(());
    };

    Err(AppError::Path {
        path: path.chars().take(80).collect(),
        reason: reason.to_string(),
    })
}
