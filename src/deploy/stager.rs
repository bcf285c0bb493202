use crate::error::AppResult;
use crate::paths::{combine, directory_list, remove_trailing_slashes};
use crate::ssh::RemoteOps;

/// Create `path` and every missing ancestor, parents first.
///
/// Relative paths are taken from the remote home directory. A path that
/// starts with the home directory is staged from the home directory down,
/// so the home directory itself is never created. Stops at the first
/// failure.
pub fn create_directory_tree(ops: &dyn RemoteOps, path: &str) -> AppResult<()> {
    let home = ops.home_dir()?;
    let relative = strip_home(&home, path);

    let dirs = directory_list(&relative);
    tracing::debug!("Staging {} directories for {}", dirs.len(), path);

    for dir in dirs {
        ops.create_directory(&combine(&home, &dir))?;
    }
    Ok(())
}

fn strip_home(home: &str, path: &str) -> String {
    let home = remove_trailing_slashes(home);
    let path = remove_trailing_slashes(path);

    if home.is_empty() || home == "/" {
        return path;
    }
    if path == home {
        return String::new();
    }
    match path.strip_prefix(&format!("{}/", home)) {
        Some(rest) => rest.to_string(),
        None => path,
    }
}
