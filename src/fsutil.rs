//! Filesystem chores that have to tolerate other tasks still touching files.

use std::io;
use std::path::Path;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::branch::Branch;

/// Keep trying to remove `path` (file or directory tree) until it is gone,
/// `timeout` elapses or `stop` is cancelled. A missing path counts as removed.
pub async fn remove_with_retry(
    path: &Path,
    every: Duration,
    timeout: Duration,
    stop: Option<&Branch>,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        let removed = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => return true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(e) => debug!(path = %path.display(), "removal failed, will retry: {e}"),
        }
        if Instant::now() + every > deadline {
            warn!(path = %path.display(), "giving up on removal");
            return false;
        }
        match stop {
            Some(branch) => tokio::select! {
                _ = branch.cancelled() => return false,
                _ = tokio::time::sleep(every) => {}
            },
            None => tokio::time::sleep(every).await,
        }
    }
}

/// Files in `dir` (not recursing) whose names start with `prefix` and end
/// with `suffix`, sorted by name.
pub fn matching_files(dir: &Path, prefix: &str, suffix: &str) -> Vec<std::path::PathBuf> {
    let mut found: Vec<_> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            let name = e.file_name().to_string_lossy();
            name.starts_with(prefix) && name.ends_with(suffix)
        })
        .map(|e| e.into_path())
        .collect();
    found.sort();
    found
}

/// Session directories are sanitized UUIDs, dashes turned into underscores.
fn looks_like_session(name: &str) -> bool {
    name.len() == 36 && uuid::Uuid::parse_str(&name.replace('_', "-")).is_ok()
}

/// Remove session directories left behind by earlier runs: empty ones, and
/// any older than `max_age`. Returns how many were removed.
pub fn sweep_stale_sessions(root: &Path, max_age: Duration) -> usize {
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !looks_like_session(&name) {
            continue;
        }
        let path = entry.path();
        let empty = std::fs::read_dir(path)
            .map(|mut d| d.next().is_none())
            .unwrap_or(false);
        let old = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| now.duration_since(t).ok())
            .is_some_and(|age| age >= max_age);
        if !(empty || old) {
            continue;
        }
        match std::fs::remove_dir_all(path) {
            Ok(()) => {
                info!(path = %path.display(), empty, "removed stale session directory");
                removed += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), "could not remove stale session directory: {e}")
            }
        }
    }
    removed
}
