//! Backup store.
//!
//! Keeps a bounded binary history of recently installed artifacts so a
//! broken deployment can be rolled back. At most one backup per plugin
//! identity, at most [`MAX_BACKUP_FILES`] globally, evicted
//! oldest-inserted-first. Every filesystem failure here is logged and
//! swallowed; the directory may race with external writers at any time.

use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::artifact;

/// Global bound on the number of backup files.
pub const MAX_BACKUP_FILES: usize = 2;

/// Smallest plausible artifact; anything below this fails the precheck.
pub const MIN_ARTIFACT_SIZE: u64 = 64;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

/// Bounded, per-identity history of artifact copies.
pub struct BackupStore {
    dir: PathBuf,
    max_backups: usize,
    // Front is the most recently inserted backup.
    backups: Mutex<VecDeque<PathBuf>>,
}

impl BackupStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_capacity(dir, MAX_BACKUP_FILES)
    }

    pub fn with_capacity(dir: impl Into<PathBuf>, max_backups: usize) -> Self {
        Self {
            dir: dir.into(),
            max_backups,
            backups: Mutex::new(VecDeque::new()),
        }
    }

    /// Copy `artifact` to `<artifact>.backup` and reconcile the history:
    /// one backup per identity, at most `max_backups` overall. Returns
    /// the backup path, or `None` if the copy failed.
    pub fn snapshot(&self, artifact_path: &Path) -> Option<PathBuf> {
        let backup = artifact::backup_path_for(artifact_path);

        let identical = match (file_digest(artifact_path), file_digest(&backup)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        };
        if identical {
            debug!(backup = %backup.display(), "backup already up to date, skipping copy");
        } else if let Err(e) = std::fs::copy(artifact_path, &backup) {
            warn!(
                artifact = %artifact_path.display(),
                error = %e,
                "failed to create backup"
            );
            return None;
        } else {
            info!(backup = %backup.display(), "created backup");
        }

        let identity = artifact::identity_of(artifact_path);
        let mut backups = self.backups.lock().unwrap_or_else(|e| e.into_inner());
        backups.retain(|existing| {
            if artifact::identity_of(existing) != identity {
                return true;
            }
            if *existing != backup {
                match std::fs::remove_file(existing) {
                    Ok(()) => info!(backup = %existing.display(), "replaced backup for identity"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(backup = %existing.display(), error = %e, "failed to remove superseded backup"),
                }
            }
            false
        });
        backups.push_front(backup.clone());

        while backups.len() > self.max_backups {
            if let Some(oldest) = backups.pop_back() {
                match std::fs::remove_file(&oldest) {
                    Ok(()) => info!(backup = %oldest.display(), "evicted old backup"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(backup = %oldest.display(), error = %e, "failed to evict backup"),
                }
            }
        }

        Some(backup)
    }

    /// Scan the directory for backup files, keep only the newest per
    /// identity, delete the rest, and rebuild the in-memory history.
    /// Called once at initialisation.
    pub fn sweep(&self) {
        let mut grouped: HashMap<String, Vec<PathBuf>> = HashMap::new();
        match std::fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if artifact::is_backup(&path) {
                        grouped.entry(artifact::identity_of(&path)).or_default().push(path);
                    }
                }
            }
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to scan for backups");
                return;
            }
        }

        let mut kept = Vec::new();
        for (identity, mut files) in grouped {
            files.sort_by_key(|p| std::cmp::Reverse(mtime(p)));
            let mut files = files.into_iter();
            if let Some(newest) = files.next() {
                debug!(identity, backup = %newest.display(), "keeping newest backup");
                kept.push(newest);
            }
            for stale in files {
                match std::fs::remove_file(&stale) {
                    Ok(()) => info!(backup = %stale.display(), "removed stale backup"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!(backup = %stale.display(), error = %e, "failed to remove stale backup"),
                }
            }
        }

        kept.sort_by_key(|p| std::cmp::Reverse(mtime(p)));
        let mut backups = self.backups.lock().unwrap_or_else(|e| e.into_inner());
        *backups = kept.into_iter().collect();
    }

    /// All live artifacts and backups in the directory, newest mtime
    /// first. These are the restore candidates.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let mut found = Vec::new();
        match std::fs::read_dir(&self.dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if artifact::is_artifact(&path) || artifact::is_backup(&path) {
                        found.push(path);
                    }
                }
            }
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to scan for restore candidates");
            }
        }
        found.sort_by_key(|p| std::cmp::Reverse(mtime(p)));
        found
    }

    /// Whether the history currently tracks a backup of `artifact_path`.
    /// Write events for a freshly restored file are recognised this way
    /// and ignored.
    pub fn tracks_artifact(&self, artifact_path: &Path) -> bool {
        let name = match artifact_path.file_name() {
            Some(name) => name,
            None => return false,
        };
        self.backups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|backup| backup.file_stem().is_some_and(|stem| stem == name))
    }

    /// Tracked backup paths, newest-inserted first.
    pub fn tracked_backups(&self) -> Vec<PathBuf> {
        self.backups
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Integrity precheck for restore paths: plausible size and ELF magic.
pub fn passes_precheck(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) if meta.len() >= MIN_ARTIFACT_SIZE => {}
        Ok(_) => {
            warn!(path = %path.display(), "artifact too small to be valid");
            return false;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot stat artifact");
            return false;
        }
    }

    let mut magic = [0u8; 4];
    match std::fs::File::open(path).and_then(|mut f| {
        use std::io::Read;
        f.read_exact(&mut magic)
    }) {
        Ok(()) if magic == ELF_MAGIC => true,
        Ok(()) => {
            warn!(path = %path.display(), "artifact is not a valid ELF file");
            false
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read artifact header");
            false
        }
    }
}

fn file_digest(path: &Path) -> Option<String> {
    let contents = std::fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&contents);
    Some(format!("{:x}", hasher.finalize()))
}

fn mtime(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;
    use std::time::Duration;

    fn fake_elf(len: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; len];
        bytes[..4].copy_from_slice(&ELF_MAGIC);
        bytes
    }

    fn write_artifact(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, fake_elf(128)).unwrap();
        path
    }

    #[test]
    fn snapshot_creates_and_overwrites_one_backup() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_artifact(dir.path(), "hello_100.so");
        let store = BackupStore::new(dir.path());

        let backup = store.snapshot(&artifact).unwrap();
        assert!(backup.exists());

        // Snapshotting twice leaves exactly one backup file.
        store.snapshot(&artifact).unwrap();
        let count = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| artifact::is_backup(&e.path()))
            .count();
        assert_eq!(count, 1);
        assert_eq!(store.tracked_backups().len(), 1);
    }

    #[test]
    fn one_backup_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::new(dir.path());

        let v100 = write_artifact(dir.path(), "hello_100.so");
        let v100_backup = store.snapshot(&v100).unwrap();
        let v101 = write_artifact(dir.path(), "hello_101.so");
        store.snapshot(&v101).unwrap();

        let tracked = store.tracked_backups();
        assert_eq!(tracked.len(), 1);
        assert!(tracked[0].ends_with("hello_101.so.backup"));
        assert!(!v100_backup.exists());
    }

    #[test]
    fn global_bound_evicts_oldest_inserted() {
        let dir = tempfile::tempdir().unwrap();
        let store = BackupStore::with_capacity(dir.path(), 2);

        let a = write_artifact(dir.path(), "alpha_1.so");
        let b = write_artifact(dir.path(), "beta_1.so");
        let c = write_artifact(dir.path(), "gamma_1.so");
        let a_backup = store.snapshot(&a).unwrap();
        store.snapshot(&b).unwrap();
        store.snapshot(&c).unwrap();

        assert_eq!(store.tracked_backups().len(), 2);
        assert!(!a_backup.exists());
        assert!(artifact::backup_path_for(&b).exists());
        assert!(artifact::backup_path_for(&c).exists());
    }

    #[test]
    fn sweep_keeps_newest_backup_per_identity() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("hello_099.so.backup");
        std::fs::write(&old, fake_elf(128)).unwrap();
        sleep(Duration::from_millis(20));
        let new = dir.path().join("hello_100.so.backup");
        std::fs::write(&new, fake_elf(128)).unwrap();

        let store = BackupStore::new(dir.path());
        store.sweep();

        assert!(!old.exists());
        assert!(new.exists());
        assert_eq!(store.tracked_backups(), vec![new]);
    }

    #[test]
    fn candidates_are_sorted_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let oldest = write_artifact(dir.path(), "hello_099.so");
        sleep(Duration::from_millis(20));
        let backup = dir.path().join("hello_100.so.backup");
        std::fs::write(&backup, fake_elf(128)).unwrap();
        sleep(Duration::from_millis(20));
        let newest = write_artifact(dir.path(), "hello_101.so");

        let store = BackupStore::new(dir.path());
        assert_eq!(store.candidates(), vec![newest, backup, oldest]);
    }

    #[test]
    fn tracks_artifact_matches_restored_files() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = write_artifact(dir.path(), "hello_100.so");
        let store = BackupStore::new(dir.path());
        store.snapshot(&artifact).unwrap();

        assert!(store.tracks_artifact(&artifact));
        assert!(!store.tracks_artifact(&dir.path().join("other_1.so")));
    }

    #[test]
    fn precheck_rejects_small_and_non_elf_files() {
        let dir = tempfile::tempdir().unwrap();

        let tiny = dir.path().join("tiny_1.so");
        std::fs::write(&tiny, fake_elf(16)).unwrap();
        assert!(!passes_precheck(&tiny));

        let text = dir.path().join("text_1.so");
        std::fs::write(&text, vec![b'x'; 128]).unwrap();
        assert!(!passes_precheck(&text));

        let valid = dir.path().join("valid_1.so");
        std::fs::write(&valid, fake_elf(128)).unwrap();
        assert!(passes_precheck(&valid));

        assert!(!passes_precheck(&dir.path().join("missing_1.so")));
    }
}
