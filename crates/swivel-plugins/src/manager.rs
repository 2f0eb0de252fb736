//! Plugin lifecycle manager.
//!
//! The state machine composing loader, watcher, debouncer, backup store
//! and registry. For every settled filesystem event it decides whether
//! to load, replace, unload, or restore. At most one restore runs at a
//! time: while the restoring latch is set, incoming watcher events are
//! dropped and the restore loop drives all activity.

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::artifact;
use crate::backup::{self, BackupStore};
use crate::debounce::{DeleteBatcher, PendingDelete, WriteDebouncer};
use crate::loader::{DynamicLoader, LoadError};
use crate::registry::PluginRegistry;
use crate::watcher::{DirectoryWatcher, WatchEventKind};

/// Watchdog budget for a single load or unload.
pub const PLUGIN_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause before acting on a write event, so multi-step copies settle.
const WRITE_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Pause after copying a backup into place on the clustered-delete path.
const RESTORE_COPY_DELAY: Duration = Duration::from_secs(1);

/// Pause after copying a backup into place inside the restore loop.
const RESTORE_LOOP_COPY_DELAY: Duration = Duration::from_millis(200);

/// Grace period for a cancelled worker to observe its stop flag.
const WORKER_GRACE: Duration = Duration::from_millis(100);

/// Short pause inside the load worker before touching the filesystem.
const WORKER_SETTLE: Duration = Duration::from_millis(100);

/// Filename pattern of watchable artifacts.
const ARTIFACT_PATTERN: &str = r".*\.so$";

/// Manager error types. Only watcher initialisation is fatal; every
/// runtime failure is recovered locally.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ManagerError {
    #[error("failed to initialise watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("manager already running")]
    AlreadyRunning,

    #[error("internal error: {0}")]
    Internal(String),
}

struct ManagerCore {
    dir: PathBuf,
    loader: DynamicLoader,
    registry: Arc<PluginRegistry>,
    backups: BackupStore,
    write_debounce: WriteDebouncer,
    delete_batch: DeleteBatcher,
    restoring: AtomicBool,
}

impl ManagerCore {
    /// Entry point for create, modify, write-closed and moved-in events.
    /// All four channels funnel here; only deletes take another path.
    async fn handle_write_event(self: &Arc<Self>, path: PathBuf) {
        if self.restoring.load(Ordering::SeqCst) {
            debug!(path = %path.display(), "restore in progress, dropping write event");
            return;
        }
        if !self.write_debounce.should_process(&path) {
            return;
        }
        if self.backups.tracks_artifact(&path) {
            debug!(path = %path.display(), "ignoring write event for restored artifact");
            return;
        }

        tokio::time::sleep(WRITE_SETTLE_DELAY).await;

        if !path.exists() {
            warn!(path = %path.display(), "artifact vanished before it settled");
            return;
        }

        // Inspect the artifact before committing to an install.
        let probe = match self.loader.load(&path) {
            Ok(probe) => probe,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load artifact for inspection");
                return;
            }
        };
        let (method, route) = match probe.plugin().as_endpoint() {
            Some(endpoint) => (endpoint.method().to_string(), endpoint.route_path().to_string()),
            None => {
                info!(
                    path = %path.display(),
                    name = probe.plugin().name(),
                    "artifact is not an endpoint plugin, ignoring"
                );
                return;
            }
        };
        drop(probe);

        match self.registry.find_endpoint_conflict(&method, &route).await {
            None => {
                match self.load_with_timeout(&path, false).await {
                    Ok(()) => {
                        self.backups.snapshot(&path);
                        self.delete_batch.discard(&artifact::identity_of(&path));
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to load new endpoint");
                    }
                }
            }
            Some(existing) if existing == path => {
                debug!(path = %path.display(), "artifact already installed, ignoring");
            }
            Some(existing) => {
                if !newer_than(&path, &existing) {
                    info!(
                        path = %path.display(),
                        existing = %existing.display(),
                        %method,
                        %route,
                        "ignoring older or same-age artifact for served route"
                    );
                    return;
                }
                info!(
                    path = %path.display(),
                    existing = %existing.display(),
                    %method,
                    %route,
                    "replacing endpoint with newer artifact"
                );
                self.backups.snapshot(&path);
                if !self.unload_with_timeout(&existing).await {
                    error!(existing = %existing.display(), "failed to unload existing plugin");
                    return;
                }
                match self.load_with_timeout(&path, false).await {
                    Ok(()) => {
                        self.delete_batch.discard(&artifact::identity_of(&path));
                    }
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            error = %e,
                            "failed to load replacement, attempting restore from backup"
                        );
                        self.restore_from_backups().await;
                    }
                }
            }
        }
    }

    /// Entry point for delete events. Opens or extends the per-identity
    /// batch and schedules its resolution once the burst quiesces.
    async fn handle_delete_event(self: &Arc<Self>, path: PathBuf) {
        if self.restoring.load(Ordering::SeqCst) {
            debug!(path = %path.display(), "restore in progress, dropping delete event");
            return;
        }

        info!(path = %path.display(), "artifact deleted");
        let is_backup = artifact::is_backup(&path);
        let (identity, opened) = self.delete_batch.observe(&path);

        if !is_backup && self.registry.contains(&path).await {
            if self.unload_with_timeout(&path).await {
                info!(path = %path.display(), "unloaded deleted plugin");
            }
        }

        if opened {
            let core = Arc::clone(self);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(core.delete_batch.window()).await;
                    if let Some(pending) = core.delete_batch.take_if_quiesced(&identity) {
                        core.process_pending_delete(&identity, pending).await;
                        return;
                    }
                    if !core.delete_batch.contains(&identity) {
                        // Retired by a reinstall of the same identity.
                        return;
                    }
                }
            });
        }
    }

    /// Resolve a quiesced deletion batch: try the surviving artifacts of
    /// the same identity, newest first, then its surviving backups.
    async fn process_pending_delete(self: &Arc<Self>, identity: &str, pending: PendingDelete) {
        info!(
            identity,
            artifact_deleted = pending.artifact_deleted,
            backup_deleted = pending.backup_deleted,
            "resolving clustered deletion"
        );

        let mut so_files = Vec::new();
        let mut backup_files = Vec::new();
        match std::fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let candidate = entry.path();
                    if candidate == pending.artifact_path || candidate == pending.backup_path {
                        continue;
                    }
                    if artifact::identity_of(&candidate) != identity {
                        continue;
                    }
                    let readable = std::fs::metadata(&candidate)
                        .map(|m| m.len() > 0)
                        .unwrap_or(false);
                    if !readable {
                        continue;
                    }
                    if artifact::is_artifact(&candidate) {
                        so_files.push(candidate);
                    } else if artifact::is_backup(&candidate) {
                        backup_files.push(candidate);
                    }
                }
            }
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to scan for surviving candidates");
            }
        }
        so_files.sort_by_key(|p| std::cmp::Reverse(mtime(p)));
        backup_files.sort_by_key(|p| std::cmp::Reverse(mtime(p)));

        for candidate in &so_files {
            debug!(candidate = %candidate.display(), "trying surviving artifact");
            if self.load_with_timeout(candidate, false).await.is_ok() {
                info!(candidate = %candidate.display(), "recovered surviving artifact");
                return;
            }
        }

        for candidate in &backup_files {
            debug!(candidate = %candidate.display(), "trying surviving backup");
            let target = artifact::restore_target_for(candidate);
            if let Err(e) = std::fs::copy(candidate, &target) {
                warn!(backup = %candidate.display(), error = %e, "failed to copy backup into place");
                continue;
            }
            tokio::time::sleep(RESTORE_COPY_DELAY).await;
            if self.load_with_timeout(&target, true).await.is_ok() {
                info!(candidate = %candidate.display(), "restored from surviving backup");
                return;
            }
            let _ = std::fs::remove_file(&target);
        }

        warn!(identity, "no surviving candidate could be loaded; plugin is gone");
    }

    /// Roll back to the newest working artifact or backup. The latch is
    /// set for the whole loop; entry and exit are atomic with respect to
    /// event intake.
    async fn restore_from_backups(self: &Arc<Self>) {
        self.restoring.store(true, Ordering::SeqCst);
        self.run_restore_loop().await;
        self.restoring.store(false, Ordering::SeqCst);
    }

    async fn run_restore_loop(self: &Arc<Self>) {
        let candidates = self.backups.candidates();
        if candidates.is_empty() {
            warn!(dir = %self.dir.display(), "no restore candidates in plugin directory");
            return;
        }

        for candidate in candidates {
            info!(candidate = %candidate.display(), "attempting restore");
            let is_backup = artifact::is_backup(&candidate);
            let target = if is_backup {
                let target = artifact::restore_target_for(&candidate);
                if let Err(e) = std::fs::copy(&candidate, &target) {
                    warn!(backup = %candidate.display(), error = %e, "failed to copy backup into place");
                    continue;
                }
                tokio::time::sleep(RESTORE_LOOP_COPY_DELAY).await;
                target
            } else {
                candidate.clone()
            };

            match self.load_with_timeout(&target, true).await {
                Ok(()) => {
                    info!(candidate = %candidate.display(), "restored plugin");
                    return;
                }
                Err(e) => {
                    warn!(candidate = %candidate.display(), error = %e, "restore candidate failed");
                    if is_backup {
                        let _ = std::fs::remove_file(&target);
                    }
                }
            }
        }

        error!(dir = %self.dir.display(), "failed to restore from any available artifact");
    }

    /// Load, initialise and install `path` under the operation watchdog.
    /// On timeout the worker's stop flag is set; the worker checks it
    /// before every mutation. Any failure removes the registry entry and
    /// unloads the library.
    async fn load_with_timeout(self: &Arc<Self>, path: &Path, is_restore: bool) -> Result<(), LoadError> {
        if !path.exists() {
            return Err(LoadError::FileNotFound(path.to_path_buf()));
        }
        let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
        if size < backup::MIN_ARTIFACT_SIZE {
            return Err(LoadError::InvalidArtifact(format!(
                "file too small to be a valid artifact ({size} bytes)"
            )));
        }
        if is_restore && !backup::passes_precheck(path) {
            return Err(LoadError::InvalidArtifact(
                "restored file failed integrity precheck".to_string(),
            ));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let core = Arc::clone(self);
        let worker_path = path.to_path_buf();
        let worker_stop = Arc::clone(&stop);
        let mut worker = tokio::spawn(async move {
            tokio::time::sleep(WORKER_SETTLE).await;
            if worker_stop.load(Ordering::SeqCst) {
                return Err(LoadError::Cancelled);
            }
            let plugin = core.loader.load(&worker_path)?;
            if worker_stop.load(Ordering::SeqCst) {
                return Err(LoadError::Cancelled);
            }
            plugin
                .plugin()
                .initialize()
                .map_err(|e| LoadError::InitFailed(e.to_string()))?;
            if worker_stop.load(Ordering::SeqCst) {
                return Err(LoadError::Cancelled);
            }
            core.registry.install(plugin).await;
            Ok(())
        });

        let result = match tokio::time::timeout(PLUGIN_OPERATION_TIMEOUT, &mut worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(LoadError::Worker(join_error.to_string())),
            Err(_elapsed) => {
                warn!(path = %path.display(), "plugin load timed out, cancelling worker");
                stop.store(true, Ordering::SeqCst);
                tokio::time::sleep(WORKER_GRACE).await;
                worker.abort();
                Err(LoadError::Timeout(PLUGIN_OPERATION_TIMEOUT))
            }
        };

        match result {
            Ok(()) => {
                info!(path = %path.display(), "plugin loaded and initialised");
                Ok(())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "plugin load failed, cleaning up");
                self.registry.remove(path).await;
                self.loader.unload(path);
                Err(e)
            }
        }
    }

    /// Remove `path` from the registry and unload it under the watchdog.
    async fn unload_with_timeout(self: &Arc<Self>, path: &Path) -> bool {
        let core = Arc::clone(self);
        let worker_path = path.to_path_buf();
        let worker = tokio::spawn(async move {
            core.registry.remove(&worker_path).await;
            core.loader.unload(&worker_path);
        });

        match tokio::time::timeout(PLUGIN_OPERATION_TIMEOUT, worker).await {
            Ok(Ok(())) => true,
            Ok(Err(join_error)) => {
                error!(path = %path.display(), error = %join_error, "unload worker failed");
                false
            }
            Err(_elapsed) => {
                error!(path = %path.display(), "plugin unload timed out");
                false
            }
        }
    }
}

/// The plugin lifecycle manager.
pub struct PluginManager {
    core: Arc<ManagerCore>,
    watcher: Option<DirectoryWatcher>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    event_loop: Option<JoinHandle<()>>,
}

impl PluginManager {
    /// Create a manager over `dir`. The directory does not need to exist
    /// yet; it is created by [`initialize`](Self::initialize).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let dir = std::path::absolute(&dir).unwrap_or(dir);
        Self {
            core: Arc::new(ManagerCore {
                loader: DynamicLoader::new(),
                registry: Arc::new(PluginRegistry::new()),
                backups: BackupStore::new(&dir),
                write_debounce: WriteDebouncer::default(),
                delete_batch: DeleteBatcher::default(),
                restoring: AtomicBool::new(false),
                dir,
            }),
            watcher: None,
            shutdown_tx: None,
            event_loop: None,
        }
    }

    /// The live routing table, shared with the HTTP layer.
    pub fn registry(&self) -> Arc<PluginRegistry> {
        Arc::clone(&self.core.registry)
    }

    /// The watched plugin directory.
    pub fn plugin_dir(&self) -> &Path {
        &self.core.dir
    }

    /// Whether a restore is currently in progress.
    pub fn is_restoring(&self) -> bool {
        self.core.restoring.load(Ordering::SeqCst)
    }

    /// Create the plugin directory if missing, sweep stale backups, and
    /// preload the newest artifact found on disk.
    pub async fn initialize(&mut self) -> Result<(), ManagerError> {
        std::fs::create_dir_all(&self.core.dir)?;
        self.core.backups.sweep();

        let newest = std::fs::read_dir(&self.core.dir)?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| artifact::is_artifact(path))
            .max_by_key(|path| mtime(path));

        if let Some(path) = newest {
            info!(path = %path.display(), "preloading newest artifact");
            // Record the preload in the debounce window; watcher events
            // for the same file inside the window are dropped.
            self.core.write_debounce.should_process(&path);
            if let Err(e) = self.core.load_with_timeout(&path, false).await {
                warn!(path = %path.display(), error = %e, "failed to preload artifact");
            }
        }

        Ok(())
    }

    /// Start the watcher and the event loop.
    pub async fn start(&mut self) -> Result<(), ManagerError> {
        if self.event_loop.is_some() {
            return Err(ManagerError::AlreadyRunning);
        }

        let pattern = Regex::new(ARTIFACT_PATTERN)
            .map_err(|e| ManagerError::Internal(format!("artifact pattern: {e}")))?;
        let mut watcher = DirectoryWatcher::new(self.core.dir.clone(), pattern);
        let mut event_rx = watcher
            .take_event_receiver()
            .ok_or_else(|| ManagerError::Internal("watcher receiver already taken".to_string()))?;
        watcher.start()?;

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let core = Arc::clone(&self.core);
        let event_loop = tokio::spawn(async move {
            loop {
                tokio::select! {
                    maybe_event = event_rx.recv() => {
                        let Some(event) = maybe_event else { break };
                        let path = std::path::absolute(&event.path)
                            .unwrap_or_else(|_| event.path.clone());
                        match event.kind {
                            WatchEventKind::Deleted => core.handle_delete_event(path).await,
                            _ => core.handle_write_event(path).await,
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("plugin event loop shutting down");
                        break;
                    }
                }
            }
        });

        self.watcher = Some(watcher);
        self.shutdown_tx = Some(shutdown_tx);
        self.event_loop = Some(event_loop);
        info!(dir = %self.core.dir.display(), "plugin manager started");
        Ok(())
    }

    /// Stop the watcher, drain the event loop, and unload every plugin.
    /// Each plugin's `cleanup` runs before its library handle closes.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(event_loop) = self.event_loop.take() {
            let _ = event_loop.await;
        }
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }

        for path in self.core.registry.paths().await {
            self.core.registry.remove(&path).await;
            self.core.loader.unload(&path);
        }
        info!("plugin manager stopped");
    }
}

fn mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Whether `candidate` has a strictly newer mtime than `existing`.
fn newer_than(candidate: &Path, existing: &Path) -> bool {
    let candidate_time = std::fs::metadata(candidate).and_then(|m| m.modified());
    let existing_time = std::fs::metadata(existing).and_then(|m| m.modified());
    match (candidate_time, existing_time) {
        (Ok(new), Ok(old)) => new > old,
        (Err(e), _) | (_, Err(e)) => {
            warn!(
                candidate = %candidate.display(),
                existing = %existing.display(),
                error = %e,
                "cannot compare artifact timestamps"
            );
            false
        }
    }
}
