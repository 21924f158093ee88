//! Deferred deletion of conversion artifacts.
//!
//! A single background task owns a min-heap of due times. Entries are one-shot:
//! when an entry comes due every path it still owns is removed from disk.
//! Nothing is persisted, so entries pending at shutdown are lost.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

enum Command {
    Schedule { id: u64, due: Instant, paths: Vec<PathBuf> },
    Cancel(u64),
}

/// Handle to a scheduled cleanup; dropping it does not cancel anything
#[derive(Debug, Clone)]
pub struct CleanupHandle {
    id: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl CleanupHandle {
    /// Cancel the cleanup if it has not fired yet
    pub fn cancel(&self) {
        let _ = self.tx.send(Command::Cancel(self.id));
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Schedule { id, paths, .. } => write!(f, "Schedule({}, {:?})", id, paths),
            Command::Cancel(id) => write!(f, "Cancel({})", id),
        }
    }
}

/// Front end of the expiry task. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ExpiryScheduler {
    tx: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
}

impl ExpiryScheduler {
    /// Spawn the expiry task on the current tokio runtime.
    ///
    /// The task exits once every scheduler clone and handle has been dropped.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_worker(rx));
        let scheduler = Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (scheduler, task)
    }

    /// Delete `paths` once `after` has elapsed from now.
    ///
    /// A path registered again by a later entry belongs to that entry; the
    /// earlier entry skips it when it fires.
    pub fn schedule_cleanup(&self, paths: Vec<PathBuf>, after: Duration) -> CleanupHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let due = Instant::now() + after;
        debug!("Scheduling cleanup {} in {:?}: {:?}", id, after, paths);
        if self.tx.send(Command::Schedule { id, due, paths }).is_err() {
            warn!("Expiry task is gone; cleanup {} will not run", id);
        }
        CleanupHandle {
            id,
            tx: self.tx.clone(),
        }
    }
}

#[derive(Default)]
struct Queue {
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    entries: HashMap<u64, Vec<PathBuf>>,
    owners: HashMap<PathBuf, u64>,
}

impl Queue {
    fn next_due(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((due, _))| *due)
    }

    fn insert(&mut self, id: u64, due: Instant, paths: Vec<PathBuf>) {
        for path in &paths {
            self.owners.insert(path.clone(), id);
        }
        self.entries.insert(id, paths);
        self.heap.push(Reverse((due, id)));
    }

    fn cancel(&mut self, id: u64) {
        // The heap slot stays behind and is skipped when popped
        if let Some(paths) = self.entries.remove(&id) {
            for path in paths {
                if self.owners.get(&path) == Some(&id) {
                    self.owners.remove(&path);
                }
            }
            debug!("Cancelled cleanup {}", id);
        }
    }

    fn fire_due(&mut self, now: Instant) {
        while let Some(Reverse((due, id))) = self.heap.peek().copied() {
            if due > now {
                break;
            }
            self.heap.pop();

            let Some(paths) = self.entries.remove(&id) else {
                continue;
            };
            for path in paths {
                if self.owners.get(&path) != Some(&id) {
                    debug!("Skipping {}: owned by a newer cleanup", path.display());
                    continue;
                }
                self.owners.remove(&path);
                remove_expired(&path);
            }
        }
    }
}

async fn run_worker(mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut queue = Queue::default();

    loop {
        let next_due = queue.next_due();
        tokio::select! {
            cmd = rx.recv() => match cmd {
                Some(Command::Schedule { id, due, paths }) => queue.insert(id, due, paths),
                Some(Command::Cancel(id)) => queue.cancel(id),
                None => break,
            },
            _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                queue.fire_due(Instant::now());
            }
        }
    }

    if !queue.entries.is_empty() {
        info!("Expiry task stopping with {} pending cleanup(s)", queue.entries.len());
    }
}

/// Best-effort delete; failures are logged and swallowed
fn remove_expired(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => info!("🗑️  Expired {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("Already gone: {}", path.display());
        }
        Err(e) => warn!("Failed to delete expired file {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, name).unwrap();
        path
    }

    #[tokio::test(start_paused = true)]
    async fn files_survive_until_window_then_vanish() {
        let dir = tempfile::tempdir().unwrap();
        let input = touch(dir.path(), "1-000001.mp4");
        let output = touch(dir.path(), "clip.mp3");
        let (scheduler, _task) = ExpiryScheduler::spawn();

        scheduler.schedule_cleanup(vec![input.clone(), output.clone()], Duration::from_secs(60));

        sleep(Duration::from_secs(59)).await;
        assert!(input.exists());
        assert!(output.exists());

        sleep(Duration::from_secs(2)).await;
        assert!(!input.exists());
        assert!(!output.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_files_do_not_stop_the_scheduler() {
        let dir = tempfile::tempdir().unwrap();
        let later = touch(dir.path(), "later.mp3");
        let (scheduler, task) = ExpiryScheduler::spawn();

        scheduler.schedule_cleanup(vec![dir.path().join("never-existed.mp3")], Duration::from_secs(5));
        // A directory cannot be removed with remove_file
        let subdir = dir.path().join("subdir");
        std::fs::create_dir(&subdir).unwrap();
        scheduler.schedule_cleanup(vec![subdir.clone()], Duration::from_secs(6));
        scheduler.schedule_cleanup(vec![later.clone()], Duration::from_secs(10));

        sleep(Duration::from_secs(11)).await;
        assert!(!later.exists());
        assert!(subdir.exists());
        assert!(!task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_cleanup_never_fires() {
        let dir = tempfile::tempdir().unwrap();
        let output = touch(dir.path(), "clip.mp3");
        let (scheduler, _task) = ExpiryScheduler::spawn();

        let handle = scheduler.schedule_cleanup(vec![output.clone()], Duration::from_secs(60));
        sleep(Duration::from_secs(10)).await;
        handle.cancel();

        sleep(Duration::from_secs(120)).await;
        assert!(output.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn newer_entry_owns_a_shared_output_path() {
        let dir = tempfile::tempdir().unwrap();
        let first_input = touch(dir.path(), "1-000001.mp4");
        let second_input = touch(dir.path(), "2-000002.mp4");
        let output = touch(dir.path(), "clip.mp3");
        let (scheduler, _task) = ExpiryScheduler::spawn();

        scheduler.schedule_cleanup(vec![first_input.clone(), output.clone()], Duration::from_secs(60));
        sleep(Duration::from_secs(30)).await;
        scheduler.schedule_cleanup(vec![second_input.clone(), output.clone()], Duration::from_secs(60));

        sleep(Duration::from_secs(31)).await;
        assert!(!first_input.exists());
        assert!(output.exists(), "output re-registered by the second job must survive");

        sleep(Duration::from_secs(30)).await;
        assert!(!second_input.exists());
        assert!(!output.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_fire_in_due_order() {
        let dir = tempfile::tempdir().unwrap();
        let slow = touch(dir.path(), "slow.mp3");
        let fast = touch(dir.path(), "fast.mp3");
        let (scheduler, _task) = ExpiryScheduler::spawn();

        scheduler.schedule_cleanup(vec![slow.clone()], Duration::from_secs(100));
        scheduler.schedule_cleanup(vec![fast.clone()], Duration::from_secs(10));

        sleep(Duration::from_secs(11)).await;
        assert!(!fast.exists());
        assert!(slow.exists());
    }

    #[tokio::test]
    async fn task_exits_when_all_senders_drop() {
        let (scheduler, task) = ExpiryScheduler::spawn();
        let handle = scheduler.schedule_cleanup(vec![PathBuf::from("/nonexistent/x")], Duration::from_secs(3600));
        drop(scheduler);
        drop(handle);
        task.await.unwrap();
    }
}
