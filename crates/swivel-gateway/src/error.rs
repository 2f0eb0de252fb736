//! Gateway runtime error type.

use thiserror::Error;

/// Runtime errors for the gateway. Dispatch failures are not errors:
/// a missing endpoint is answered with a 404 produced by the gateway
/// itself.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum GatewayError {
    /// Binding or serving the listener failed.
    #[error("server error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Generic internal error with a human-readable message.
    #[error("internal gateway error: {0}")]
    Internal(String),
}

/// Convenience alias.
pub type GatewayResult<T> = Result<T, GatewayError>;
