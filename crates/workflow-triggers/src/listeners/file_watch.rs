//! FileWatch listener (spec.md §4.7): recursive filesystem watch, filtered
//! by include/exclude glob patterns, fed through the [`Debouncer`].

use crate::debounce::{ChangeKind, Debouncer, FileChange};
use crate::error::{TriggerError, TriggerResult};
use crate::glob_match;
use crate::listener::{ConnectionFlag, Listener};
use crate::model::{IncomingMessage, Source};
use async_trait::async_trait;
use notify::{RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct FileWatchListener {
    root: PathBuf,
    include: Vec<String>,
    exclude: Vec<String>,
    debounce_interval: Duration,
    connected: Arc<ConnectionFlag>,
    stop: CancellationToken,
}

impl FileWatchListener {
    pub fn new(
        root: impl Into<PathBuf>,
        include: &[String],
        exclude: &[String],
        debounce_interval: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            include: include.to_vec(),
            exclude: exclude.to_vec(),
            debounce_interval,
            connected: Arc::new(ConnectionFlag::new()),
            stop: CancellationToken::new(),
        }
    }

    fn passes_filter(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        if self.exclude.iter().any(|p| glob_match::matches(p, &path_str)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| glob_match::matches(p, &path_str))
    }
}

#[async_trait]
impl Listener for FileWatchListener {
    fn source(&self) -> Source {
        Source::FileWatch
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    async fn start(&self, sink: mpsc::Sender<IncomingMessage>, cancel: CancellationToken) -> TriggerResult<()> {
        let linked = cancel.child_token();
        let child = linked.clone();
        let self_stop = self.stop.clone();
        tokio::spawn(async move {
            self_stop.cancelled().await;
            child.cancel();
        });

        let (batch_tx, mut batch_rx) = mpsc::unbounded_channel::<Vec<FileChange>>();
        let debouncer = Arc::new(Debouncer::new(self.debounce_interval, batch_tx));

        let (raw_tx, mut raw_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = raw_tx.send(res);
        })
        .map_err(|e| TriggerError::Connect("file_watch".to_string(), e.to_string()))?;
        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| TriggerError::Connect("file_watch".to_string(), e.to_string()))?;
        self.connected.set(true);

        let feeder_debouncer = debouncer.clone();
        let feeder_cancel = linked.clone();
        let feeder = async move {
            loop {
                tokio::select! {
                    _ = feeder_cancel.cancelled() => break,
                    event = raw_rx.recv() => {
                        let Some(event) = event else { break };
                        if let Ok(event) = event {
                            for path in &event.paths {
                                let Some(kind) = to_change_kind(&event.kind) else { continue };
                                feeder_debouncer
                                    .file_changed(FileChange { path: path.clone(), kind, at: chrono::Utc::now() })
                                    .await;
                            }
                        }
                    }
                }
            }
        };

        let emitter_sink = sink.clone();
        let emitter = async move {
            loop {
                tokio::select! {
                    _ = linked.cancelled() => break,
                    batch = batch_rx.recv() => {
                        let Some(batch) = batch else { break };
                        for change in batch {
                            if !self.passes_filter(&change.path) {
                                continue;
                            }
                            let text = format!("{:?} {}", change.kind, change.path.display());
                            let payload = serde_json::json!({
                                "path": change.path.to_string_lossy(),
                                "kind": format!("{:?}", change.kind),
                            });
                            let message = IncomingMessage::new(Source::FileWatch, text, payload);
                            let _ = emitter_sink.send(message).await;
                        }
                    }
                }
            }
        };

        tokio::join!(feeder, emitter);
        debouncer.dispose().await;
        self.connected.set(false);
        Ok(())
    }

    async fn stop(&self) -> TriggerResult<()> {
        self.stop.cancel();
        Ok(())
    }

    /// A filesystem change has no channel to reply on.
    async fn send_response(&self, _message: &IncomingMessage, _text: &str) -> TriggerResult<()> {
        Ok(())
    }
}

fn to_change_kind(kind: &notify::EventKind) -> Option<ChangeKind> {
    use notify::EventKind;
    match kind {
        EventKind::Create(_) => Some(ChangeKind::Created),
        EventKind::Modify(_) => Some(ChangeKind::Modified),
        EventKind::Remove(_) => Some(ChangeKind::Removed),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_pattern_restricts_matches() {
        let listener = FileWatchListener::new("/tmp", &["**/*.rs".to_string()], &[], Duration::from_millis(1));
        assert!(listener.passes_filter(Path::new("/tmp/src/main.rs")));
        assert!(!listener.passes_filter(Path::new("/tmp/src/main.txt")));
    }

    #[test]
    fn exclude_pattern_wins_over_include() {
        let listener = FileWatchListener::new(
            "/tmp",
            &["**/*.rs".to_string()],
            &["**/target/**".to_string()],
            Duration::from_millis(1),
        );
        assert!(!listener.passes_filter(Path::new("/tmp/target/debug/main.rs")));
    }

    #[test]
    fn empty_include_list_matches_everything_not_excluded() {
        let listener = FileWatchListener::new("/tmp", &[], &["**/*.log".to_string()], Duration::from_millis(1));
        assert!(listener.passes_filter(Path::new("/tmp/src/main.rs")));
        assert!(!listener.passes_filter(Path::new("/tmp/out.log")));
    }
}
