//! Debouncer for filesystem change events (spec.md §4.7): keyed by path,
//! last-write-wins, single timer reset per change, fires the accumulated
//! batch exactly once per quiet window.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Clone)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub at: chrono::DateTime<chrono::Utc>,
}

struct Pending {
    entries: HashMap<PathBuf, FileChange>,
    generation: u64,
}

/// `Debouncer`. A single mutex guards both the pending-entries map and the
/// current timer generation (spec.md §5: "a single mutex for the timer and
/// a concurrent map for pending changes" — collapsed to one mutex here
/// since both sides must move together to avoid firing a stale
/// generation's batch).
pub struct Debouncer {
    interval: Duration,
    pending: Arc<Mutex<Pending>>,
    out: mpsc::UnboundedSender<Vec<FileChange>>,
}

impl Debouncer {
    pub fn new(interval: Duration, out: mpsc::UnboundedSender<Vec<FileChange>>) -> Self {
        Self {
            interval,
            pending: Arc::new(Mutex::new(Pending { entries: HashMap::new(), generation: 0 })),
            out,
        }
    }

    /// `FileChanged(path, kind, ts)`: upserts the entry and restarts the
    /// debounce window.
    pub async fn file_changed(&self, change: FileChange) {
        let generation = {
            let mut guard = self.pending.lock().await;
            guard.entries.insert(change.path.clone(), change);
            guard.generation += 1;
            guard.generation
        };

        let pending = self.pending.clone();
        let interval = self.interval;
        let out = self.out.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(Instant::now() + interval).await;
            let mut guard = pending.lock().await;
            if guard.generation != generation {
                // superseded by a later change to the same or another path
                return;
            }
            let batch: Vec<FileChange> = guard.entries.drain().map(|(_, v)| v).collect();
            drop(guard);
            if !batch.is_empty() {
                let _ = out.send(batch);
            }
        });
    }

    /// Stops pending work by invalidating the current generation; any timer
    /// already in flight will see the mismatch and drop its batch.
    pub async fn dispose(&self) {
        let mut guard = self.pending.lock().await;
        guard.entries.clear();
        guard.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collapses_repeated_writes_into_one_batch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let debouncer = Debouncer::new(Duration::from_millis(30), tx);

        let path = PathBuf::from("/tmp/a.txt");
        for _ in 0..5 {
            debouncer
                .file_changed(FileChange { path: path.clone(), kind: ChangeKind::Modified, at: chrono::Utc::now() })
                .await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let batch = tokio::time::timeout(Duration::from_millis(200), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].path, path);
    }

    #[tokio::test]
    async fn dispose_drops_pending_batch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let debouncer = Debouncer::new(Duration::from_millis(30), tx);
        debouncer
            .file_changed(FileChange {
                path: PathBuf::from("/tmp/b.txt"),
                kind: ChangeKind::Created,
                at: chrono::Utc::now(),
            })
            .await;
        debouncer.dispose().await;

        let result = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(result.is_err(), "no batch should fire after dispose");
    }
}
