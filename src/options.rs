//! Client configuration and the option pipeline.
//!
//! A [`Client`](crate::Client) holds default [`ClientOptions`] plus a list of
//! [`KnockOption`] mutators. Every call resolves its own copy:
//!
//! 1. clone the defaults
//! 2. apply the client-level options in order
//! 3. apply the call-level options in order
//!
//! Later options override earlier ones, so call-level settings win. The first
//! option that rejects the configuration stops resolution.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use crate::error::ConfigError;
use crate::instrument::{DialControl, Middleware};

/// Effective configuration for one knock.
#[derive(Clone)]
pub struct ClientOptions {
    /// Deadline for dial, request, response head and body. Default: 5s.
    pub timeout: Duration,
    /// Follow 3xx responses carrying a `Location`. Default: true.
    pub follow_redirects: bool,
    /// Maximum number of redirects to follow. Default: 10.
    pub max_redirects: u32,
    /// Add `Host` when the request does not carry one. Default: true.
    pub automatic_host_header: bool,
    /// Add `Content-Length` for bodies when missing. Default: true.
    pub automatic_content_length: bool,
    /// Headers applied on top of the request's headers.
    pub custom_headers: Vec<(String, String)>,
    /// Bytes written instead of the serialized request.
    pub custom_raw_bytes: Option<Bytes>,
    /// HTTP proxy URL (`http://host:port`).
    pub proxy: Option<url::Url>,
    /// Connect timeout for the proxy. Default: 5s.
    pub proxy_dial_timeout: Duration,
    /// TLS server name override; empty means derive from the host.
    pub sni: String,
    /// Local address to bind before connecting.
    pub source_addr: Option<SocketAddr>,
    /// Invoked with the remote address before every connect attempt.
    pub control: Option<DialControl>,
    /// Invoked after every successful dial.
    pub middlewares: Vec<Arc<dyn Middleware>>,
    /// End of the current knock, set per call. Connect attempts are cut
    /// short at this instant.
    pub deadline: Option<Instant>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            follow_redirects: true,
            max_redirects: 10,
            automatic_host_header: true,
            automatic_content_length: true,
            custom_headers: Vec::new(),
            custom_raw_bytes: None,
            proxy: None,
            proxy_dial_timeout: Duration::from_secs(5),
            sni: String::new(),
            source_addr: None,
            control: None,
            middlewares: Vec::new(),
            deadline: None,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("timeout", &self.timeout)
            .field("follow_redirects", &self.follow_redirects)
            .field("max_redirects", &self.max_redirects)
            .field("automatic_host_header", &self.automatic_host_header)
            .field("automatic_content_length", &self.automatic_content_length)
            .field("custom_headers", &self.custom_headers)
            .field("custom_raw_bytes", &self.custom_raw_bytes)
            .field("proxy", &self.proxy.as_ref().map(|u| u.as_str()))
            .field("proxy_dial_timeout", &self.proxy_dial_timeout)
            .field("sni", &self.sni)
            .field("source_addr", &self.source_addr)
            .field("control", &self.control.is_some())
            .field("middlewares", &self.middlewares.len())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// A named configuration mutator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KnockOption {
    Timeout(Duration),
    /// Proxy URL; an empty string disables the proxy.
    Proxy(String),
    ProxyDialTimeout(Duration),
    Sni(String),
    /// Replaces a same-named header or appends a new one.
    Header(String, String),
    Headers(Vec<(String, String)>),
    FollowRedirects(bool),
    MaxRedirects(u32),
    RawBytes(Bytes),
    AutomaticHostHeader(bool),
    AutomaticContentLength(bool),
    SourceAddr(SocketAddr),
}

impl KnockOption {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Proxy(_) => "proxy",
            Self::ProxyDialTimeout(_) => "proxy_dial_timeout",
            Self::Sni(_) => "sni",
            Self::Header(..) => "header",
            Self::Headers(_) => "headers",
            Self::FollowRedirects(_) => "follow_redirects",
            Self::MaxRedirects(_) => "max_redirects",
            Self::RawBytes(_) => "raw_bytes",
            Self::AutomaticHostHeader(_) => "automatic_host_header",
            Self::AutomaticContentLength(_) => "automatic_content_length",
            Self::SourceAddr(_) => "source_addr",
        }
    }

    /// Apply this option to `opts`.
    pub fn apply(&self, opts: &mut ClientOptions) -> Result<(), ConfigError> {
        match self {
            Self::Timeout(d) => opts.timeout = non_zero(self.name(), *d)?,
            Self::ProxyDialTimeout(d) => opts.proxy_dial_timeout = non_zero(self.name(), *d)?,
            Self::Proxy(raw) => opts.proxy = parse_proxy(raw)?,
            Self::Sni(name) => {
                if name.chars().any(|c| c.is_whitespace() || c == '\0') {
                    return Err(ConfigError::InvalidSni(name.clone()));
                }
                opts.sni = name.clone();
            }
            Self::Header(name, value) => set_header(&mut opts.custom_headers, name, value)?,
            Self::Headers(headers) => {
                for (name, value) in headers {
                    set_header(&mut opts.custom_headers, name, value)?;
                }
            }
            Self::FollowRedirects(on) => opts.follow_redirects = *on,
            Self::MaxRedirects(n) => opts.max_redirects = *n,
            Self::RawBytes(raw) => opts.custom_raw_bytes = Some(raw.clone()),
            Self::AutomaticHostHeader(on) => opts.automatic_host_header = *on,
            Self::AutomaticContentLength(on) => opts.automatic_content_length = *on,
            Self::SourceAddr(addr) => opts.source_addr = Some(*addr),
        }
        Ok(())
    }
}

/// Apply `mutators` in order to a copy of `defaults`.
///
/// On rejection the partially built options are returned alongside the error.
pub fn resolve<'a>(
    defaults: &ClientOptions,
    mutators: impl IntoIterator<Item = &'a KnockOption>,
) -> Result<ClientOptions, (ClientOptions, ConfigError)> {
    let mut opts = defaults.clone();
    for option in mutators {
        if let Err(e) = option.apply(&mut opts) {
            return Err((opts, e));
        }
    }
    Ok(opts)
}

fn non_zero(option: &'static str, d: Duration) -> Result<Duration, ConfigError> {
    if d.is_zero() {
        return Err(ConfigError::ZeroTimeout { option });
    }
    Ok(d)
}

fn parse_proxy(raw: &str) -> Result<Option<url::Url>, ConfigError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let url = url::Url::parse(raw).map_err(|e| ConfigError::InvalidProxy {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "http" {
        return Err(ConfigError::UnsupportedProxyScheme(url.scheme().to_string()));
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidProxy {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(Some(url))
}

fn set_header(
    headers: &mut Vec<(String, String)>,
    name: &str,
    value: &str,
) -> Result<(), ConfigError> {
    if name.is_empty() || !name.bytes().all(is_tchar) {
        return Err(ConfigError::InvalidHeader {
            name: name.to_string(),
            reason: "name is not a token",
        });
    }
    if value.bytes().any(|b| b == 0 || b == b'\r' || b == b'\n') {
        return Err(ConfigError::InvalidHeader {
            name: name.to_string(),
            reason: "value contains CR, LF or NUL",
        });
    }
    match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
        Some(existing) => existing.1 = value.to_string(),
        None => headers.push((name.to_string(), value.to_string())),
    }
    Ok(())
}

/// Token characters per RFC 9110 Section 5.6.2.
pub(crate) fn is_tchar(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' | b'0'..=b'9' | b'A'..=b'Z' | b'a'..=b'z'
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ClientOptions::default();
        assert_eq!(opts.timeout, Duration::from_secs(5));
        assert!(opts.follow_redirects);
        assert_eq!(opts.max_redirects, 10);
        assert!(opts.automatic_host_header);
        assert!(opts.automatic_content_length);
        assert!(opts.proxy.is_none());
        assert_eq!(opts.proxy_dial_timeout, Duration::from_secs(5));
        assert!(opts.sni.is_empty());
        assert!(opts.control.is_none());
        assert!(opts.middlewares.is_empty());
    }

    #[test]
    fn test_later_options_override_earlier() {
        let client_level = [
            KnockOption::Timeout(Duration::from_secs(1)),
            KnockOption::Sni("client.example".into()),
        ];
        let call_level = [KnockOption::Sni("call.example".into())];

        let opts = resolve(
            &ClientOptions::default(),
            client_level.iter().chain(call_level.iter()),
        )
        .unwrap();
        assert_eq!(opts.timeout, Duration::from_secs(1));
        assert_eq!(opts.sni, "call.example");
    }

    #[test]
    fn test_resolve_does_not_touch_defaults() {
        let defaults = ClientOptions::default();
        let opts = resolve(&defaults, &[KnockOption::FollowRedirects(false)]).unwrap();
        assert!(!opts.follow_redirects);
        assert!(defaults.follow_redirects);
    }

    #[test]
    fn test_rejection_stops_and_returns_partial() {
        let options = [
            KnockOption::MaxRedirects(3),
            KnockOption::Proxy("not a url".into()),
            KnockOption::MaxRedirects(7),
        ];
        let (partial, err) = resolve(&ClientOptions::default(), &options).unwrap_err();
        assert_eq!(partial.max_redirects, 3);
        assert!(matches!(err, ConfigError::InvalidProxy { .. }));
    }

    #[test]
    fn test_proxy_validation() {
        let mut opts = ClientOptions::default();
        KnockOption::Proxy("http://127.0.0.1:8080".into())
            .apply(&mut opts)
            .unwrap();
        assert_eq!(opts.proxy.as_ref().unwrap().port(), Some(8080));

        KnockOption::Proxy(String::new()).apply(&mut opts).unwrap();
        assert!(opts.proxy.is_none());

        assert_eq!(
            KnockOption::Proxy("socks5://127.0.0.1:1080".into()).apply(&mut opts),
            Err(ConfigError::UnsupportedProxyScheme("socks5".into()))
        );
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut opts = ClientOptions::default();
        assert_eq!(
            KnockOption::Timeout(Duration::ZERO).apply(&mut opts),
            Err(ConfigError::ZeroTimeout { option: "timeout" })
        );
        assert!(KnockOption::ProxyDialTimeout(Duration::ZERO)
            .apply(&mut opts)
            .is_err());
    }

    #[test]
    fn test_header_replaces_case_insensitively() {
        let mut opts = ClientOptions::default();
        KnockOption::Header("User-Agent".into(), "a".into())
            .apply(&mut opts)
            .unwrap();
        KnockOption::Headers(vec![
            ("user-agent".into(), "b".into()),
            ("X-Probe".into(), "1".into()),
        ])
        .apply(&mut opts)
        .unwrap();
        assert_eq!(
            opts.custom_headers,
            vec![
                ("User-Agent".to_string(), "b".to_string()),
                ("X-Probe".to_string(), "1".to_string())
            ]
        );
    }

    #[test]
    fn test_header_injection_rejected() {
        let mut opts = ClientOptions::default();
        assert!(KnockOption::Header("X-Evil".into(), "a\r\nInjected: 1".into())
            .apply(&mut opts)
            .is_err());
        assert!(KnockOption::Header("Bad Name".into(), "v".into())
            .apply(&mut opts)
            .is_err());
        assert!(KnockOption::Sni("has space".into()).apply(&mut opts).is_err());
    }
}
