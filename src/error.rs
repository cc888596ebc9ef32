//! Error types for the knock crate.

use std::io;
use std::time::Duration;

use crate::snapshot::Snapshot;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A configuration mutator rejected the options.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Timeouts must be non-zero.
    #[error("{option}: timeout must be greater than zero")]
    ZeroTimeout { option: &'static str },

    /// Proxy URL could not be parsed or has no host.
    #[error("invalid proxy URL {url:?}: {reason}")]
    InvalidProxy { url: String, reason: String },

    /// Proxy scheme other than http.
    #[error("unsupported proxy scheme {0:?} (only http is supported)")]
    UnsupportedProxyScheme(String),

    /// Header name is not a token or value contains CR/LF/NUL.
    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: &'static str },

    /// SNI value contains whitespace or NUL.
    #[error("invalid SNI {0:?}")]
    InvalidSni(String),
}

/// Errors that can occur during a knock.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Option resolution failed; no request was attempted.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// An internal fault (panic) was caught and converted.
    #[error("unexpected failure: {0}")]
    Unexpected(String),

    /// Target URL could not be built or parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// Connection error (DNS, connect, socket setup).
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connect timeout (TCP + proxy tunnel + TLS handshake).
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// The request deadline expired.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// TLS/SSL error.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Proxy refused or broke the tunnel.
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// HTTP protocol error.
    #[error("HTTP protocol error: {0}")]
    HttpProtocol(String),

    /// Redirect limit exceeded.
    #[error("Redirect limit exceeded ({count} redirects)")]
    RedirectLimit { count: u32 },

    /// Invalid redirect URL.
    #[error("Invalid redirect URL: {0}")]
    InvalidRedirectUrl(String),

    /// Decompression error.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Create a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create an HTTP protocol error.
    pub fn http_protocol(message: impl Into<String>) -> Self {
        Self::HttpProtocol(message.into())
    }

    /// Create a TLS error.
    pub fn tls(message: impl Into<String>) -> Self {
        Self::Tls(message.into())
    }

    /// Create a proxy error.
    pub fn proxy(message: impl Into<String>) -> Self {
        Self::Proxy(message.into())
    }

    /// Create an unexpected-failure error.
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// True for failures of the request itself (dial, TLS, proxy, protocol, timeout).
    pub fn is_connection(&self) -> bool {
        !matches!(
            self,
            Self::Config(_) | Self::Unexpected(_) | Self::Decompression(_) | Self::Json(_)
        )
    }
}

/// A failed knock: the error together with the snapshot collected up to the failure.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct KnockError {
    #[source]
    error: Error,
    snapshot: Box<Snapshot>,
}

impl KnockError {
    pub(crate) fn new(error: Error, snapshot: Snapshot) -> Self {
        Self {
            error,
            snapshot: Box::new(snapshot),
        }
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> Snapshot {
        *self.snapshot
    }

    pub fn into_parts(self) -> (Error, Snapshot) {
        (self.error, *self.snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;

    #[test]
    fn test_connection_classification() {
        assert!(Error::connection("refused").is_connection());
        assert!(Error::Timeout(Duration::from_secs(1)).is_connection());
        assert!(Error::RedirectLimit { count: 10 }.is_connection());
        assert!(!Error::unexpected("boom").is_connection());
        assert!(!Error::Config(ConfigError::InvalidSni("a b".into())).is_connection());
    }

    #[test]
    fn test_knock_error_keeps_snapshot() {
        let snapshot = Snapshot::new(Request::get("/probe"));
        let err = KnockError::new(Error::connection("refused"), snapshot);
        assert_eq!(err.to_string(), "Connection error: refused");
        assert_eq!(err.snapshot().request().uri(), "/probe");

        let (error, snapshot) = err.into_parts();
        assert!(error.is_connection());
        assert!(snapshot.response().is_none());
    }
}
