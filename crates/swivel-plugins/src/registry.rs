//! Plugin registry.
//!
//! The live routing table: artifact path to loaded plugin, plus the
//! query surface the HTTP layer uses. Writes are serialised by the
//! single registry lock; reads take the same lock briefly and the
//! handler itself runs outside it, kept alive by the caller's
//! [`DynamicPlugin`] reference for the duration of one request.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use swivel_kernel::plugin::PluginKind;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::loader::DynamicPlugin;

/// A loaded plugin installed in the routing table.
#[derive(Clone)]
pub struct LoadedEntry {
    pub path: PathBuf,
    pub plugin: DynamicPlugin,
    pub installed_at: Instant,
}

/// Thread-safe table of loaded plugins keyed by artifact path.
pub struct PluginRegistry {
    entries: RwLock<HashMap<PathBuf, LoadedEntry>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Install a plugin under its artifact path, replacing any previous
    /// entry for the same path.
    pub async fn install(&self, plugin: DynamicPlugin) {
        let path = plugin.path().to_path_buf();
        info!(
            path = %path.display(),
            name = plugin.plugin().name(),
            "installing plugin into registry"
        );
        let entry = LoadedEntry {
            path: path.clone(),
            plugin,
            installed_at: Instant::now(),
        };
        let mut entries = self.entries.write().await;
        entries.insert(path, entry);
    }

    /// Remove the entry for `path`, returning it if present.
    pub async fn remove(&self, path: &Path) -> Option<LoadedEntry> {
        let mut entries = self.entries.write().await;
        let removed = entries.remove(path);
        if removed.is_some() {
            info!(path = %path.display(), "removed plugin from registry");
        }
        removed
    }

    /// Get the plugin loaded from `path`.
    pub async fn get_by_path(&self, path: &Path) -> Option<DynamicPlugin> {
        let entries = self.entries.read().await;
        entries.get(path).map(|entry| entry.plugin.clone())
    }

    /// All plugins of the given category.
    pub async fn list_by_kind(&self, kind: PluginKind) -> Vec<DynamicPlugin> {
        let entries = self.entries.read().await;
        entries
            .values()
            .filter(|entry| entry.plugin.plugin().kind() == kind)
            .map(|entry| entry.plugin.clone())
            .collect()
    }

    /// The endpoint plugin serving `(method, path)`, if any. The caller
    /// keeps the returned reference for the duration of the request so a
    /// concurrent removal cannot dangle the handler.
    pub async fn lookup_endpoint(&self, method: &str, target: &str) -> Option<DynamicPlugin> {
        let entries = self.entries.read().await;
        entries.values().find_map(|entry| {
            let endpoint = entry.plugin.plugin().as_endpoint()?;
            if endpoint.method() == method && endpoint.route_path() == target {
                Some(entry.plugin.clone())
            } else {
                None
            }
        })
    }

    /// The artifact path of the endpoint entry already serving
    /// `(method, path)`, if any. Used at install time to enforce that no
    /// two endpoint entries share a route.
    pub async fn find_endpoint_conflict(&self, method: &str, target: &str) -> Option<PathBuf> {
        let entries = self.entries.read().await;
        let conflict = entries.values().find_map(|entry| {
            let endpoint = entry.plugin.plugin().as_endpoint()?;
            if endpoint.method() == method && endpoint.route_path() == target {
                Some(entry.path.clone())
            } else {
                None
            }
        });
        if let Some(ref path) = conflict {
            debug!(
                method,
                target,
                existing = %path.display(),
                "endpoint route already served"
            );
        }
        conflict
    }

    /// Whether an entry exists for `path`.
    pub async fn contains(&self, path: &Path) -> bool {
        self.entries.read().await.contains_key(path)
    }

    /// All installed artifact paths.
    pub async fn paths(&self) -> Vec<PathBuf> {
        self.entries.read().await.keys().cloned().collect()
    }

    /// Number of installed plugins.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}
