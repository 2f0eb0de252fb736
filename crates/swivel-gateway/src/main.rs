//! swivel: an HTTP server with hot-swappable endpoint plugins.
//!
//! Reads configuration from environment variables, starts the plugin
//! lifecycle manager over the watched directory, and serves HTTP until
//! interrupted.
//!
//! # Environment variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SWIVEL_HOST` | `0.0.0.0` | Address to listen on. |
//! | `SWIVEL_PORT` | `8080` | TCP port to listen on. |
//! | `SWIVEL_PLUGIN_DIR` | `endpoints` | Directory watched for plugin artifacts. |

use swivel_gateway::{GatewayConfig, GatewayServer};
use swivel_plugins::PluginManager;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("swivel_plugins=info".parse().unwrap())
                .add_directive("swivel_gateway=info".parse().unwrap()),
        )
        .init();

    let host = std::env::var("SWIVEL_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = std::env::var("SWIVEL_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let plugin_dir =
        std::env::var("SWIVEL_PLUGIN_DIR").unwrap_or_else(|_| "endpoints".to_string());

    let mut manager = PluginManager::new(&plugin_dir);
    if let Err(e) = manager.initialize().await {
        error!(dir = %plugin_dir, error = %e, "failed to initialise plugin manager");
        std::process::exit(1);
    }
    if let Err(e) = manager.start().await {
        // A watcher that cannot be constructed is fatal; without it the
        // server would silently never pick up a deployment.
        error!(dir = %plugin_dir, error = %e, "failed to start plugin manager");
        std::process::exit(1);
    }

    info!(
        dir = %manager.plugin_dir().display(),
        %host,
        port,
        "swivel starting"
    );

    let config = GatewayConfig::new().with_host(host).with_port(port);
    let server = GatewayServer::new(config, manager.registry());

    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                error!(error = %e, "gateway exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
    }

    manager.stop().await;
}
