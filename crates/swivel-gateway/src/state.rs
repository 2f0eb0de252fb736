//! Shared application state for the gateway.

use std::sync::Arc;
use swivel_plugins::PluginRegistry;

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The live routing table, owned by the plugin manager.
    pub registry: Arc<PluginRegistry>,
}

impl AppState {
    /// Create a new `AppState` wrapping the given registry.
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }
}
