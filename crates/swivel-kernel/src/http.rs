//! Structural HTTP message types.
//!
//! The gateway and the plugins agree on these two types only; compatibility
//! is by structural match on the fields, not on any shared web-framework
//! type. Keeping the contract this small is what lets a plugin built
//! against one gateway build keep working against the next.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An HTTP request as seen by an endpoint handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request method, upper-case (`GET`, `POST`, ...).
    pub method: String,
    /// Request target path, always absolute (`/hello`).
    pub target: String,
    /// Header map, one value per name.
    pub headers: HashMap<String, String>,
    /// Request body as a UTF-8 string.
    pub body: String,
}

impl Request {
    /// Create a request with an empty header map and body.
    pub fn new(method: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers: HashMap::new(),
            body: String::new(),
        }
    }

    /// Set a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// Get a header value by name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|v| v.as_str())
    }
}

/// An HTTP response produced by an endpoint handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Status code (`200`, `404`, ...).
    pub status: u16,
    /// Header map, one value per name.
    pub headers: HashMap<String, String>,
    /// Response body as a UTF-8 string.
    pub body: String,
}

impl Response {
    /// Create an empty response with the given status.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: String::new(),
        }
    }

    /// 200 OK with a plain-text body.
    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200)
            .with_header("content-type", "text/plain")
            .with_body(body)
    }

    /// 404 Not Found with a plain-text body.
    pub fn not_found(body: impl Into<String>) -> Self {
        Self::new(404)
            .with_header("content-type", "text/plain")
            .with_body(body)
    }

    /// Set a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Set the body.
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder() {
        let req = Request::new("GET", "/hello")
            .with_header("accept", "text/plain")
            .with_body("ping");

        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/hello");
        assert_eq!(req.header("accept"), Some("text/plain"));
        assert_eq!(req.header("x-missing"), None);
        assert_eq!(req.body, "ping");
    }

    #[test]
    fn response_shorthands() {
        let ok = Response::ok("hi");
        assert_eq!(ok.status, 200);
        assert_eq!(ok.headers.get("content-type").map(String::as_str), Some("text/plain"));

        let nf = Response::not_found("nope");
        assert_eq!(nf.status, 404);
        assert_eq!(nf.body, "nope");
    }

    #[test]
    fn serde_round_trip() {
        let req = Request::new("POST", "/submit").with_body("{}");
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back.method, "POST");
        assert_eq!(back.target, "/submit");
    }
}
