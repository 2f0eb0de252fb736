//! HTTP front end for the swivel hot-swap plugin server.
//!
//! Every request is resolved against the live plugin registry by
//! `(method, path)`; the matching endpoint plugin's handler produces the
//! response. The gateway holds a plugin reference for the duration of a
//! request, so a concurrent hot-swap can never dangle a handler.
//!
//! # Endpoints
//!
//! | Method | Path      | Description                               |
//! |--------|-----------|-------------------------------------------|
//! | `GET`  | `/health` | Liveness probe with the loaded plugin count |
//! | *any*  | *any*     | Dispatched to the matching endpoint plugin |
//!
//! # Example
//!
//! ```rust,no_run
//! use swivel_gateway::{GatewayConfig, GatewayServer};
//! use swivel_plugins::PluginManager;
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut manager = PluginManager::new("endpoints");
//!     manager.initialize().await.unwrap();
//!     manager.start().await.unwrap();
//!
//!     let config = GatewayConfig::new().with_port(8080);
//!     GatewayServer::new(config, manager.registry())
//!         .start()
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod error;
pub mod server;
pub mod state;

pub use error::{GatewayError, GatewayResult};
pub use server::{GatewayConfig, GatewayServer};
pub use state::AppState;
