//! Typed errors for the plugin ABI.

use thiserror::Error;

/// Errors a plugin may raise across the ABI boundary.
///
/// A plugin that fails `initialize` is treated as a failed load by the
/// host and rolled back; no error ever propagates past the host's
/// lifecycle controller.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PluginError {
    /// Plugin failed during initialisation.
    #[error("plugin initialization failed: {0}")]
    InitFailed(String),

    /// An operation was attempted while the plugin was in an incompatible state.
    #[error("plugin not in valid state: {0}")]
    InvalidState(String),

    /// Catch-all for errors that don't fit the above categories.
    #[error("{0}")]
    Other(String),
}
