//! Plugin ABI contract.
//!
//! A plugin is a cdylib exporting one C symbol, `createPlugin`, that
//! returns an owned instance of a type implementing [`Plugin`]. The host
//! takes ownership of the instance, wraps it in an `Arc`, and drives the
//! lifecycle: `initialize` exactly once before first use, `cleanup`
//! exactly once before the library handle is closed.
//!
//! Both sides of the boundary are built by the same toolchain from this
//! workspace, so the factory hands a Rust trait object across `extern
//! "C"` the same way the rest of the workspace passes them around.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::http::{Request, Response};

mod error;
pub use error::PluginError;

/// Plugin operation result type using the typed [`PluginError`].
pub type PluginResult<T> = Result<T, PluginError>;

/// The closed set of plugin categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginKind {
    Controller,
    Endpoint,
    Router,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginKind::Controller => write!(f, "controller"),
            PluginKind::Endpoint => write!(f, "endpoint"),
            PluginKind::Router => write!(f, "router"),
        }
    }
}

/// Core plugin trait.
///
/// Object-safe and synchronous: instances cross a C boundary and are
/// shared behind `Arc`, so all lifecycle calls take `&self` and any
/// mutable state lives behind interior mutability inside the plugin.
pub trait Plugin: Send + Sync {
    /// Display name of the plugin.
    fn name(&self) -> &str;

    /// Category of the plugin.
    fn kind(&self) -> PluginKind;

    /// Called exactly once after creation, before the plugin serves.
    fn initialize(&self) -> PluginResult<()>;

    /// Called exactly once before the library handle is closed. Must
    /// release any cached resources, in particular a memoised handler.
    fn cleanup(&self);

    /// Downcast hook for the `Endpoint` category.
    fn as_endpoint(&self) -> Option<&dyn EndpointPlugin> {
        None
    }
}

/// A request handler produced by an endpoint plugin.
pub type Handler = Arc<dyn Fn(&Request) -> Response + Send + Sync>;

/// A plugin that serves a single HTTP route.
pub trait EndpointPlugin: Plugin {
    /// The route path this endpoint serves (`/hello`).
    fn route_path(&self) -> &str;

    /// The HTTP method this endpoint serves (`GET`).
    fn method(&self) -> &str;

    /// The handler callable. Implementations memoise the closure on
    /// first call and invalidate it from `cleanup`; [`HandlerCell`]
    /// does both.
    fn handler(&self) -> Handler;
}

/// Memoisation cell for an endpoint handler.
///
/// Builds the handler lazily on the first request after `initialize`
/// and drops it on `cleanup`. Handler clones already given out remain
/// callable; invalidation only clears the cache.
#[derive(Default)]
pub struct HandlerCell {
    inner: Mutex<Option<Handler>>,
}

impl HandlerCell {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Return the cached handler, building it with `make` if absent.
    pub fn get_or_init(&self, make: impl FnOnce() -> Handler) -> Handler {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        slot.get_or_insert_with(make).clone()
    }

    /// Drop the cached handler.
    pub fn invalidate(&self) {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *slot = None;
    }

    /// Whether a handler is currently cached.
    pub fn is_cached(&self) -> bool {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

/// Export the `createPlugin` factory symbol for an endpoint plugin.
///
/// ```ignore
/// export_endpoint_plugin!(HelloEndpoint, HelloEndpoint::new());
/// ```
#[macro_export]
macro_rules! export_endpoint_plugin {
    ($plugin_type:ty, $ctor:expr) => {
        #[no_mangle]
        #[allow(non_snake_case, improper_ctypes_definitions)]
        pub extern "C" fn createPlugin() -> *mut dyn $crate::plugin::Plugin {
            let plugin: Box<dyn $crate::plugin::Plugin> = Box::new($ctor);
            Box::into_raw(plugin)
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        cell: HandlerCell,
        builds: AtomicUsize,
    }

    impl Echo {
        fn new() -> Self {
            Self {
                cell: HandlerCell::new(),
                builds: AtomicUsize::new(0),
            }
        }
    }

    impl Plugin for Echo {
        fn name(&self) -> &str {
            "echo"
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

    impl EndpointPlugin for Echo {
        fn route_path(&self) -> &str {
            "/echo"
        }
        fn method(&self) -> &str {
            "POST"
        }
        fn handler(&self) -> Handler {
            self.cell.get_or_init(|| {
                self.builds.fetch_add(1, Ordering::SeqCst);
                Arc::new(|req: &Request| Response::ok(req.body.clone()))
            })
        }
    }

    #[test]
    fn handler_is_memoised() {
        let plugin = Echo::new();
        let a = plugin.handler();
        let b = plugin.handler();
        assert_eq!(plugin.builds.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn cleanup_invalidates_handler_cache() {
        let plugin = Echo::new();
        let before = plugin.handler();
        assert!(plugin.cell.is_cached());

        plugin.cleanup();
        assert!(!plugin.cell.is_cached());

        // A clone taken before cleanup stays callable.
        let resp = before(&Request::new("POST", "/echo").with_body("still here"));
        assert_eq!(resp.body, "still here");

        // The next request rebuilds the handler.
        let _ = plugin.handler();
        assert_eq!(plugin.builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn endpoint_downcast() {
        let plugin: Box<dyn Plugin> = Box::new(Echo::new());
        let endpoint = plugin.as_endpoint().expect("echo is an endpoint");
        assert_eq!(endpoint.route_path(), "/echo");
        assert_eq!(endpoint.method(), "POST");
        assert_eq!(plugin.kind(), PluginKind::Endpoint);
    }
}
