//! Dynamic plugin loader.
//!
//! Translates an artifact path into a live plugin instance and owns the
//! library handle with a strict lifetime contract: the handle is closed
//! exactly once, strictly after the last plugin reference derived from
//! it has been dropped, and `cleanup` runs before the close.

use libloading::Library;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use swivel_kernel::plugin::Plugin;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Well-known factory symbol every plugin artifact exports.
const FACTORY_SYMBOL: &[u8] = b"createPlugin";

/// Plugin load error types. All recoverable; the lifecycle controller
/// reacts by retrying, unloading, or entering its restore loop.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum LoadError {
    #[error("plugin file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("failed to open library: {0}")]
    OpenFailed(String),

    #[error("factory symbol `createPlugin` missing: {0}")]
    SymbolMissing(String),

    #[error("plugin factory returned null")]
    FactoryReturnedNull,

    #[error("plugin initialization failed: {0}")]
    InitFailed(String),

    #[error("artifact rejected: {0}")]
    InvalidArtifact(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation cancelled")]
    Cancelled,

    #[error("load worker failed: {0}")]
    Worker(String),

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// A loaded plugin together with the library it came from.
///
/// Cloning is cheap (two `Arc` bumps). The library handle is closed when
/// the last clone is dropped; the plugin instance is destroyed first
/// because of field order, so code from the library never runs after the
/// handle is gone.
#[derive(Clone)]
pub struct DynamicPlugin {
    plugin: Arc<dyn Plugin>,
    _library: Option<Arc<Library>>,
    path: PathBuf,
    instance_id: Uuid,
    loaded_at: Instant,
}

impl std::fmt::Debug for DynamicPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicPlugin")
            .field("path", &self.path)
            .field("instance_id", &self.instance_id)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

impl DynamicPlugin {
    fn from_library(plugin: Arc<dyn Plugin>, library: Arc<Library>, path: PathBuf) -> Self {
        Self {
            plugin,
            _library: Some(library),
            path,
            instance_id: Uuid::now_v7(),
            loaded_at: Instant::now(),
        }
    }

    /// Wrap an in-process plugin instance that is not backed by a
    /// dynamic library (built-in or test plugins).
    pub fn from_instance(plugin: Arc<dyn Plugin>, path: impl Into<PathBuf>) -> Self {
        Self {
            plugin,
            _library: None,
            path: path.into(),
            instance_id: Uuid::now_v7(),
            loaded_at: Instant::now(),
        }
    }

    /// The plugin instance.
    pub fn plugin(&self) -> &dyn Plugin {
        self.plugin.as_ref()
    }

    /// The artifact path this plugin was loaded from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Unique id of this load, for log correlation.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// When this plugin was loaded.
    pub fn loaded_at(&self) -> Instant {
        self.loaded_at
    }
}

/// Loader memoising one plugin per canonical absolute artifact path.
///
/// The dynamic-linker namespace is process-global: two opens of the same
/// file do not yield independent instances, so a previously loaded path
/// returns the cached plugin instead of a fresh load.
pub struct DynamicLoader {
    loaded: Mutex<HashMap<PathBuf, DynamicPlugin>>,
}

impl DynamicLoader {
    pub fn new() -> Self {
        Self {
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Load the artifact at `path`, or return the memoised plugin if the
    /// path is already loaded.
    ///
    /// Opens the library with immediate symbol resolution, resolves the
    /// `createPlugin` factory and takes ownership of the instance it
    /// returns. On any failure after the open, the handle is closed
    /// before the error is returned.
    pub fn load(&self, path: &Path) -> Result<DynamicPlugin, LoadError> {
        let abs = std::path::absolute(path)?;

        let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = loaded.get(&abs) {
            debug!(path = %abs.display(), "plugin already loaded, returning cached instance");
            return Ok(existing.clone());
        }

        if !abs.exists() {
            return Err(LoadError::FileNotFound(abs));
        }

        let library =
            unsafe { Library::new(&abs) }.map_err(|e| LoadError::OpenFailed(e.to_string()))?;

        let raw = {
            let factory = unsafe {
                library.get::<unsafe extern "C" fn() -> *mut dyn Plugin>(FACTORY_SYMBOL)
            }
            .map_err(|e| LoadError::SymbolMissing(e.to_string()))?;
            unsafe { factory() }
        };
        if raw.is_null() {
            return Err(LoadError::FactoryReturnedNull);
        }
        let plugin: Arc<dyn Plugin> = Arc::from(unsafe { Box::from_raw(raw) });

        let dynamic = DynamicPlugin::from_library(plugin, Arc::new(library), abs.clone());
        info!(
            path = %abs.display(),
            name = dynamic.plugin().name(),
            kind = %dynamic.plugin().kind(),
            instance_id = %dynamic.instance_id(),
            "loaded plugin library"
        );
        loaded.insert(abs, dynamic.clone());
        Ok(dynamic)
    }

    /// Drop the memoised entry for `path`: run `cleanup`, release the
    /// plugin reference, close the handle once the last outstanding
    /// clone is gone. Idempotent on unknown paths.
    pub fn unload(&self, path: &Path) {
        let abs = match std::path::absolute(path) {
            Ok(p) => p,
            Err(_) => path.to_path_buf(),
        };
        let removed = {
            let mut loaded = self.loaded.lock().unwrap_or_else(|e| e.into_inner());
            loaded.remove(&abs)
        };
        if let Some(entry) = removed {
            info!(path = %abs.display(), "unloading plugin library");
            entry.plugin().cleanup();
        }
    }

    /// Whether `path` is currently loaded.
    pub fn is_loaded(&self, path: &Path) -> bool {
        let abs = match std::path::absolute(path) {
            Ok(p) => p,
            Err(_) => path.to_path_buf(),
        };
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&abs)
    }

    /// Paths of all currently loaded libraries.
    pub fn loaded_paths(&self) -> Vec<PathBuf> {
        self.loaded
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

impl Default for DynamicLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for DynamicLoader {
    fn drop(&mut self) {
        let loaded = self.loaded.get_mut().unwrap_or_else(|e| e.into_inner());
        for (path, entry) in loaded.iter() {
            debug!(path = %path.display(), "closing plugin library at loader shutdown");
            entry.plugin().cleanup();
        }
    }
}
