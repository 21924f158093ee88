use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use walkdir::WalkDir;

/// Delete files directly inside `dirs` that were last modified more than
/// `max_age` before `now`.
///
/// Cleanup timers do not survive a restart, so anything older than the
/// retention window found at startup is an orphan. Returns the number of
/// files removed.
pub async fn sweep_orphans(dirs: &[PathBuf], max_age: Duration, now: SystemTime) -> Result<usize> {
    let mut removed = 0;

    for dir in dirs {
        if !dir.exists() {
            continue;
        }

        // Use walkdir in blocking task to find stale files
        let stale = tokio::task::spawn_blocking({
            let dir = dir.clone();
            move || find_stale(&dir, max_age, now)
        })
        .await
        .context("Failed to scan for orphaned files")?;

        for path in stale {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    info!("🧹 Removed orphaned file: {}", path.display());
                }
                Err(e) => warn!("Failed to remove orphaned file {}: {}", path.display(), e),
            }
        }
    }

    Ok(removed)
}

fn find_stale(dir: &Path, max_age: Duration, now: SystemTime) -> Vec<PathBuf> {
    let mut stale = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = match entry.metadata().ok().and_then(|m| m.modified().ok()) {
            Some(t) => t,
            None => continue,
        };
        // Files from the future (clock skew) count as fresh
        let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
        if age > max_age {
            stale.push(entry.into_path());
        } else {
            debug!("Keeping {} (age {:?})", entry.path().display(), age);
        }
    }

    stale
}
