//! Artifact naming conventions.
//!
//! Live artifacts are named `<identity>_<tag>.so` where `<tag>` is an
//! opaque build tag without underscores; backups append `.backup` to the
//! full artifact file name. The identity is what ties successive
//! versions of one logical plugin together. Versions are ordered by file
//! mtime, never by the tag.

use std::path::{Path, PathBuf};

/// Extension of a live plugin artifact.
pub const ARTIFACT_EXTENSION: &str = "so";

/// Suffix appended to an artifact file name to form its backup name.
pub const BACKUP_SUFFIX: &str = ".backup";

/// Whether `path` names a live plugin artifact (`*.so`).
pub fn is_artifact(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ARTIFACT_EXTENSION)
}

/// Whether `path` names a backup of a plugin artifact (`*.so.backup`).
pub fn is_backup(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(&format!(".{ARTIFACT_EXTENSION}{BACKUP_SUFFIX}")))
}

/// The logical plugin identity of an artifact or backup path.
///
/// Strips the `.backup` suffix if present, the `.so` extension, and the
/// final underscore-delimited tag. A file name without a tag maps to its
/// whole stem.
pub fn identity_of(path: &Path) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let name = name.strip_suffix(BACKUP_SUFFIX).unwrap_or(name);
    let stem = name
        .strip_suffix(&format!(".{ARTIFACT_EXTENSION}"))
        .unwrap_or(name);
    match stem.rfind('_') {
        Some(idx) => stem[..idx].to_string(),
        None => stem.to_string(),
    }
}

/// The backup path for an artifact: `<path>.backup`.
pub fn backup_path_for(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// The artifact path a backup restores to: `<path>` minus `.backup`.
pub fn restore_target_for(backup: &Path) -> PathBuf {
    match backup.to_str().and_then(|s| s.strip_suffix(BACKUP_SUFFIX)) {
        Some(stripped) => PathBuf::from(stripped),
        None => backup.to_path_buf(),
    }
}
