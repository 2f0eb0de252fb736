//! Demo endpoint plugin serving `GET /hello`.
//!
//! Build as a cdylib and drop the resulting artifact into the watched
//! directory as `hello_<tag>.so`:
//!
//! ```sh
//! cargo build -p swivel-hello-endpoint --release
//! cp target/release/libswivel_hello_endpoint.so endpoints/hello_$(date +%Y%m%dT%H%M%S).so
//! ```

use chrono::Local;
use swivel_kernel::export_endpoint_plugin;
use swivel_kernel::http::{Request, Response};
use swivel_kernel::plugin::{
    EndpointPlugin, Handler, HandlerCell, Plugin, PluginKind, PluginResult,
};
use std::sync::Arc;

/// Set `SWIVEL_BUILD_TAG` at build time to tell deployments apart when
/// exercising hot reload.
const BUILD_TAG: &str = match option_env!("SWIVEL_BUILD_TAG") {
    Some(tag) => tag,
    None => "dev",
};

pub struct HelloEndpoint {
    handler: HandlerCell,
}

impl HelloEndpoint {
    pub fn new() -> Self {
        Self {
            handler: HandlerCell::new(),
        }
    }
}

impl Default for HelloEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for HelloEndpoint {
    fn name(&self) -> &str {
        "hello"
    }

    fn kind(&self) -> PluginKind {
        PluginKind::Endpoint
    }

    fn initialize(&self) -> PluginResult<()> {
        Ok(())
    }

    fn cleanup(&self) {
        self.handler.invalidate();
    }

    fn as_endpoint(&self) -> Option<&dyn EndpointPlugin> {
        Some(self)
    }
}

impl EndpointPlugin for HelloEndpoint {
    fn route_path(&self) -> &str {
        "/hello"
    }

    fn method(&self) -> &str {
        "GET"
    }

    fn handler(&self) -> Handler {
        self.handler.get_or_init(|| {
            Arc::new(|_req: &Request| {
                let now = Local::now().format("%Y-%m-%d %H:%M:%S");
                Response::ok(format!(
                    "Hello from swivel!\nBuild {BUILD_TAG}\nCurrent time: {now}\n"
                ))
            })
        })
    }
}

export_endpoint_plugin!(HelloEndpoint, HelloEndpoint::new());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responds_with_greeting() {
        let plugin = HelloEndpoint::new();
        plugin.initialize().unwrap();

        let handler = plugin.handler();
        let response = handler(&Request::new("GET", "/hello"));

        assert_eq!(response.status, 200);
        assert!(response.body.starts_with("Hello"));
    }

    #[test]
    fn route_and_method() {
        let plugin = HelloEndpoint::new();
        assert_eq!(plugin.route_path(), "/hello");
        assert_eq!(plugin.method(), "GET");
        assert_eq!(plugin.kind(), PluginKind::Endpoint);
    }

    #[test]
    fn cleanup_drops_cached_handler() {
        let plugin = HelloEndpoint::new();
        let _ = plugin.handler();
        plugin.cleanup();
        // A fresh handler is built on the next request.
        let handler = plugin.handler();
        let response = handler(&Request::new("GET", "/hello"));
        assert_eq!(response.status, 200);
    }
}
