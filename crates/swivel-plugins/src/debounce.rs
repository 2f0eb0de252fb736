//! Event debouncing.
//!
//! Two orthogonal mechanisms sit between the watcher and the lifecycle
//! controller:
//!
//! - [`WriteDebouncer`] collapses bursts of write events on the same
//!   artifact path into one install attempt per window.
//! - [`DeleteBatcher`] accumulates the near-simultaneous delete events a
//!   deployment removal produces (artifact plus backup) into a single
//!   per-identity resolution once the burst has quiesced.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::artifact;

/// Default window within which repeat write events on a path are dropped.
pub const WRITE_DEBOUNCE_WINDOW: Duration = Duration::from_secs(10);

/// Default age after which stale debounce entries are garbage-collected.
pub const DEBOUNCE_GC_WINDOW: Duration = Duration::from_secs(60);

/// Default quiescence window for clustered deletions.
pub const DELETE_BATCH_TIMEOUT: Duration = Duration::from_millis(200);

/// Per-path write debouncer.
pub struct WriteDebouncer {
    window: Duration,
    gc_after: Duration,
    last_seen: Mutex<HashMap<PathBuf, Instant>>,
}

impl WriteDebouncer {
    pub fn new(window: Duration, gc_after: Duration) -> Self {
        Self {
            window,
            gc_after,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Record a write event for `path` and decide whether it should be
    /// processed. A second event inside the window is dropped. Entries
    /// older than the GC window are swept opportunistically while the
    /// lock is held.
    pub fn should_process(&self, path: &Path) -> bool {
        let mut last_seen = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        let process = match last_seen.get(path) {
            Some(last) if now.duration_since(*last) < self.window => false,
            _ => {
                last_seen.insert(path.to_path_buf(), now);
                true
            }
        };

        last_seen.retain(|_, seen| now.duration_since(*seen) <= self.gc_after);

        if !process {
            debug!(path = %path.display(), "debouncing repeat write event");
        }
        process
    }

    /// Number of tracked paths, for tests and diagnostics.
    pub fn tracked(&self) -> usize {
        self.last_seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for WriteDebouncer {
    fn default() -> Self {
        Self::new(WRITE_DEBOUNCE_WINDOW, DEBOUNCE_GC_WINDOW)
    }
}

/// Per-identity deletion accumulator.
#[derive(Debug, Clone)]
pub struct PendingDelete {
    /// The artifact path presumed deleted.
    pub artifact_path: PathBuf,
    /// The backup path presumed deleted.
    pub backup_path: PathBuf,
    /// When the first delete for this identity was observed.
    pub first_seen: Instant,
    /// Whether the live artifact was among the deleted files.
    pub artifact_deleted: bool,
    /// Whether the backup was among the deleted files.
    pub backup_deleted: bool,
}

/// Batches clustered delete events that belong to one logical plugin.
pub struct DeleteBatcher {
    window: Duration,
    pending: Mutex<HashMap<String, PendingDelete>>,
}

impl DeleteBatcher {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// The quiescence window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a delete event. Returns the identity and whether this
    /// opened a new batch (the caller schedules resolution only then).
    pub fn observe(&self, path: &Path) -> (String, bool) {
        let identity = artifact::identity_of(path);
        let is_backup = artifact::is_backup(path);

        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let opened = !pending.contains_key(&identity);
        let entry = pending.entry(identity.clone()).or_insert_with(|| {
            let artifact_path = if is_backup {
                artifact::restore_target_for(path)
            } else {
                path.to_path_buf()
            };
            let backup_path = artifact::backup_path_for(&artifact_path);
            PendingDelete {
                artifact_path,
                backup_path,
                first_seen: Instant::now(),
                artifact_deleted: false,
                backup_deleted: false,
            }
        });
        if is_backup {
            entry.backup_deleted = true;
        } else {
            entry.artifact_deleted = true;
        }
        (identity, opened)
    }

    /// Hand the batch for `identity` to the caller if its window has
    /// quiesced; otherwise leave it pending so the caller reschedules.
    pub fn take_if_quiesced(&self, identity: &str) -> Option<PendingDelete> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match pending.get(identity) {
            Some(entry) if entry.first_seen.elapsed() >= self.window => pending.remove(identity),
            _ => None,
        }
    }

    /// Whether a batch is pending for `identity`.
    pub fn contains(&self, identity: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(identity)
    }

    /// Retire a pending batch without resolving it (the identity was
    /// reinstalled by a later event).
    pub fn discard(&self, identity: &str) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if pending.remove(identity).is_some() {
            debug!(identity, "discarding pending delete batch");
        }
    }
}

impl Default for DeleteBatcher {
    fn default() -> Self {
        Self::new(DELETE_BATCH_TIMEOUT)
    }
}
