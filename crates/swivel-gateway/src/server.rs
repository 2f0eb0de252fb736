//! Gateway HTTP server.
//!
//! A thin axum front end over the plugin registry: `/health` plus a
//! fallback that dispatches every other request to the endpoint plugin
//! serving its `(method, path)`.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use swivel_plugins::PluginRegistry;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::error::GatewayResult;
use crate::state::AppState;

/// Largest request body the gateway will buffer for a plugin handler.
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Gateway server configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Bind host
    pub host: String,
    /// Bind port
    pub port: u16,
    /// Whether to enable CORS for all origins
    pub enable_cors: bool,
    /// Whether to enable per-request tracing logs
    pub enable_tracing: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: false,
            enable_tracing: true,
        }
    }
}

impl GatewayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_cors(mut self, enable: bool) -> Self {
        self.enable_cors = enable;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], self.port)))
    }
}

/// The HTTP server in front of the plugin registry.
pub struct GatewayServer {
    config: GatewayConfig,
    registry: Arc<PluginRegistry>,
}

impl GatewayServer {
    /// Create a server backed by the given registry.
    pub fn new(config: GatewayConfig, registry: Arc<PluginRegistry>) -> Self {
        Self { config, registry }
    }

    /// Build the axum `Router` without starting the server.
    ///
    /// Useful for integration tests that want to drive the server via
    /// `tower::ServiceExt`.
    pub fn build_router(&self) -> Router {
        let state = Arc::new(AppState::new(self.registry.clone()));

        let mut router = Router::new()
            .route("/health", get(health))
            .fallback(dispatch)
            .with_state(state);

        if self.config.enable_tracing {
            router = router.layer(TraceLayer::new_for_http());
        }
        if self.config.enable_cors {
            router = router.layer(CorsLayer::new().allow_origin(Any).allow_headers(Any));
        }
        router
    }

    /// Start the server and block until it exits.
    pub async fn start(self) -> GatewayResult<()> {
        let addr = self.config.socket_addr();
        info!("swivel gateway starting on http://{}", addr);

        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;
        Ok(())
    }
}

/// GET /health - liveness probe.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let plugins = state.registry.len().await;
    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "plugins": plugins })),
    )
}

/// Dispatch a request to the endpoint plugin serving its route.
///
/// The plugin reference obtained from the registry is held until the
/// handler has returned, so a concurrent removal cannot close the
/// library under a running handler.
async fn dispatch(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let (parts, body) = req.into_parts();
    let method = parts.method.as_str().to_string();
    let target = parts.uri.path().to_string();

    if target.is_empty() || !target.starts_with('/') || target.contains("..") {
        return plain(StatusCode::BAD_REQUEST, "Illegal request-target".to_string());
    }

    let Some(plugin) = state.registry.lookup_endpoint(&method, &target).await else {
        debug!(%method, %target, "no matching endpoint");
        return plain(
            StatusCode::NOT_FOUND,
            format!("The resource '{target}' was not found."),
        );
    };

    let mut headers = HashMap::new();
    for (name, value) in &parts.headers {
        if let Ok(value) = value.to_str() {
            headers.insert(name.as_str().to_string(), value.to_string());
        }
    }
    let body = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(_) => {
            return plain(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Request body too large".to_string(),
            )
        }
    };

    let request = swivel_kernel::Request {
        method,
        target,
        headers,
        body,
    };

    let Some(endpoint) = plugin.plugin().as_endpoint() else {
        return plain(
            StatusCode::NOT_FOUND,
            format!("The resource '{}' was not found.", request.target),
        );
    };
    let handler = endpoint.handler();
    let response = handler(&request);
    into_axum(response)
}

fn plain(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

fn into_axum(response: swivel_kernel::Response) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = status;
    for (name, value) in &response.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            out.headers_mut().insert(name, value);
        }
    }
    out.headers_mut()
        .insert(header::SERVER, HeaderValue::from_static("swivel"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use swivel_kernel::http::{Request as PluginRequest, Response as PluginResponse};
    use swivel_kernel::plugin::{
        EndpointPlugin, Handler, HandlerCell, Plugin, PluginKind, PluginResult,
    };
    use swivel_plugins::DynamicPlugin;
    use tower::ServiceExt;

    struct HelloEndpoint {
        cell: HandlerCell,
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
            self.cell.invalidate();
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
            self.cell.get_or_init(|| {
                Arc::new(|req: &PluginRequest| {
                    PluginResponse::ok(format!("Hello from {}", req.target))
                })
            })
        }
    }

    async fn registry_with_hello() -> Arc<PluginRegistry> {
        let registry = Arc::new(PluginRegistry::new());
        registry
            .install(DynamicPlugin::from_instance(
                Arc::new(HelloEndpoint {
                    cell: HandlerCell::new(),
                }),
                "/p/hello_100.so",
            ))
            .await;
        registry
    }

    fn get(uri: &str) -> Request {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[test]
    fn default_config() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.port, 8080);
        assert!(!cfg.enable_cors);
    }

    #[test]
    fn builder_methods() {
        let cfg = GatewayConfig::new()
            .with_host("127.0.0.1")
            .with_port(9000)
            .with_cors(true);
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 9000);
        assert!(cfg.enable_cors);
        assert_eq!(cfg.socket_addr().port(), 9000);
    }

    #[tokio::test]
    async fn dispatches_to_matching_endpoint() {
        let registry = registry_with_hello().await;
        let router = GatewayServer::new(GatewayConfig::new(), registry).build_router();

        let response = router.oneshot(get("/hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        assert!(body.starts_with(b"Hello"));
    }

    #[tokio::test]
    async fn unmatched_route_is_not_found() {
        let registry = registry_with_hello().await;
        let router = GatewayServer::new(GatewayConfig::new(), registry).build_router();

        let response = router.oneshot(get("/missing")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        assert_eq!(
            String::from_utf8_lossy(&body),
            "The resource '/missing' was not found."
        );
    }

    #[tokio::test]
    async fn method_must_match_too() {
        let registry = registry_with_hello().await;
        let router = GatewayServer::new(GatewayConfig::new(), registry).build_router();

        let request = Request::builder()
            .method("POST")
            .uri("/hello")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn dot_dot_targets_are_rejected() {
        let registry = registry_with_hello().await;
        let router = GatewayServer::new(GatewayConfig::new(), registry).build_router();

        let response = router.oneshot(get("/static/../hello")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_plugin_count() {
        let registry = registry_with_hello().await;
        let router = GatewayServer::new(GatewayConfig::new(), registry).build_router();

        let response = router.oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), MAX_BODY_BYTES).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["plugins"], 1);
    }
}
