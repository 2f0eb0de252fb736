//! Directory watcher for plugin artifacts.
//!
//! Watches a single directory and delivers typed events for files whose
//! basename matches a pattern. Moves into the directory are the normal
//! deployment path (atomic rename) and are surfaced as [`WatchEventKind::MovedIn`],
//! which consumers treat like a create.

use notify::{
    event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode},
    Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Typed watch event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    /// File created in the watched directory.
    Created,
    /// File contents modified.
    Modified,
    /// File removed.
    Deleted,
    /// A writer closed the file.
    WriteClosed,
    /// File moved into the watched directory.
    MovedIn,
}

impl WatchEventKind {
    /// Whether this event announces new or changed content, as opposed
    /// to a removal.
    pub fn is_write(&self) -> bool {
        !matches!(self, WatchEventKind::Deleted)
    }
}

/// A typed event with its fully qualified path.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub path: PathBuf,
    pub timestamp: Instant,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, path: PathBuf) -> Self {
        Self {
            kind,
            path,
            timestamp: Instant::now(),
        }
    }
}

/// Watcher over one directory, filtered by a filename pattern.
///
/// Events are produced on the OS watcher's dedicated backend thread and
/// forwarded into a channel; `stop` drops the watcher, which joins that
/// thread before returning. Start and stop are idempotent.
pub struct DirectoryWatcher {
    dir: PathBuf,
    pattern: Regex,
    event_tx: mpsc::Sender<WatchEvent>,
    event_rx: Option<mpsc::Receiver<WatchEvent>>,
    watcher: Option<RecommendedWatcher>,
}

impl DirectoryWatcher {
    pub fn new(dir: impl Into<PathBuf>, pattern: Regex) -> Self {
        let (event_tx, event_rx) = mpsc::channel(1024);
        Self {
            dir: dir.into(),
            pattern,
            event_tx,
            event_rx: Some(event_rx),
            watcher: None,
        }
    }

    /// Take the event receiver (can only be taken once).
    pub fn take_event_receiver(&mut self) -> Option<mpsc::Receiver<WatchEvent>> {
        self.event_rx.take()
    }

    /// The watched directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start delivering events. Idempotent.
    pub fn start(&mut self) -> Result<(), notify::Error> {
        if self.watcher.is_some() {
            return Ok(());
        }

        info!(dir = %self.dir.display(), pattern = %self.pattern, "starting directory watcher");

        let tx = self.event_tx.clone();
        let pattern = self.pattern.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        warn!(error = %e, "watch backend error");
                        return;
                    }
                };
                for typed in translate(&event, &pattern) {
                    debug!(?typed, "watch event");
                    if tx.blocking_send(typed).is_err() {
                        // Receiver gone; the manager is shutting down.
                        return;
                    }
                }
            },
            Config::default(),
        )?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        self.watcher = Some(watcher);
        Ok(())
    }

    /// Stop delivering events, joining the backend thread. Idempotent.
    pub fn stop(&mut self) {
        if self.watcher.take().is_some() {
            info!(dir = %self.dir.display(), "stopped directory watcher");
        }
    }

    /// Whether the watcher is currently running.
    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Map a raw notify event to typed events for matching paths.
fn translate(event: &Event, pattern: &Regex) -> Vec<WatchEvent> {
    let kind = match event.kind {
        EventKind::Create(CreateKind::File) | EventKind::Create(CreateKind::Any) => {
            WatchEventKind::Created
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => WatchEventKind::MovedIn,
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            WatchEventKind::Modified
        }
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => WatchEventKind::WriteClosed,
        EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => {
            WatchEventKind::Deleted
        }
        _ => return Vec::new(),
    };

    event
        .paths
        .iter()
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| pattern.is_match(name))
        })
        .map(|path| WatchEvent::new(kind, path.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn artifact_pattern() -> Regex {
        Regex::new(r".*\.so$").unwrap()
    }

    #[test]
    fn translate_filters_by_basename() {
        let event = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/p/hello_1.so"))
            .add_path(PathBuf::from("/p/notes.txt"));

        let typed = translate(&event, &artifact_pattern());
        assert_eq!(typed.len(), 1);
        assert_eq!(typed[0].kind, WatchEventKind::Created);
        assert_eq!(typed[0].path, PathBuf::from("/p/hello_1.so"));
    }

    #[test]
    fn translate_maps_rename_to_moved_in() {
        let event = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(PathBuf::from("/p/hello_2.so"));

        let typed = translate(&event, &artifact_pattern());
        assert_eq!(typed[0].kind, WatchEventKind::MovedIn);
        assert!(typed[0].kind.is_write());
    }

    #[test]
    fn delete_is_not_a_write() {
        assert!(!WatchEventKind::Deleted.is_write());
        assert!(WatchEventKind::WriteClosed.is_write());
    }

    #[tokio::test]
    async fn receiver_can_only_be_taken_once() {
        let mut watcher = DirectoryWatcher::new("/tmp", artifact_pattern());
        assert!(watcher.take_event_receiver().is_some());
        assert!(watcher.take_event_receiver().is_none());
    }

    #[tokio::test]
    async fn delivers_create_events_for_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = DirectoryWatcher::new(dir.path(), artifact_pattern());
        let mut rx = watcher.take_event_receiver().unwrap();
        watcher.start().unwrap();
        // Starting twice is a no-op.
        watcher.start().unwrap();

        let target = dir.path().join("hello_1.so");
        tokio::task::spawn_blocking(move || {
            std::fs::write(target, b"not really a library").unwrap();
        })
        .await
        .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("watcher channel closed");
                if event.kind.is_write() {
                    break event;
                }
            }
        })
        .await
        .expect("no event within timeout");

        assert_eq!(event.path.file_name().unwrap(), "hello_1.so");
        watcher.stop();
        assert!(!watcher.is_running());
    }
}
