//! The request to send.
//!
//! Everything here is written to the wire as given: the method token, the
//! request target and the version string are not normalized, and headers keep
//! their order and casing.

use bytes::Bytes;
use http::Method;
use serde::{Serialize, Serializer};

/// A raw HTTP request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Request {
    #[serde(serialize_with = "serialize_method")]
    method: Method,
    uri: String,
    version: String,
    headers: Vec<(String, String)>,
    body: Option<Bytes>,
}

impl Request {
    /// Create a request with the given method and request target (`/path?query`).
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Create a GET request.
    pub fn get(uri: impl Into<String>) -> Self {
        Self::new(Method::GET, uri)
    }

    /// Create a POST request.
    pub fn post(uri: impl Into<String>) -> Self {
        Self::new(Method::POST, uri)
    }

    /// Set the protocol version string written on the request line.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Append a header, keeping insertion order.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the request body.
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn http_version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Body bytes, `None` when the request carries no body.
    pub fn body_bytes(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
}

fn serialize_method<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(method.as_str())
}
