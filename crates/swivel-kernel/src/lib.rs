//! Shared contracts for the swivel hot-swap plugin server.
//!
//! This crate is the only thing a plugin needs to depend on:
//! - The plugin ABI ([`plugin::Plugin`], [`plugin::EndpointPlugin`], the
//!   `createPlugin` factory symbol generated by [`export_endpoint_plugin!`])
//! - The structural HTTP message types exchanged between the gateway and
//!   endpoint handlers ([`http::Request`], [`http::Response`])
//! - The typed plugin error ([`plugin::PluginError`])

pub mod http;
pub mod plugin;

pub use http::{Request, Response};
pub use plugin::{
    EndpointPlugin, Handler, HandlerCell, Plugin, PluginError, PluginKind, PluginResult,
};
