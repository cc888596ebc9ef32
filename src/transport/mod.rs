//! HTTP transport.
//!
//! - raw HTTP/1.x over TCP or BoringSSL TLS
//! - HTTP proxies (absolute-form and CONNECT tunnels)
//! - redirect following, one fresh connection per hop

pub mod connector;
pub mod dialer;
pub mod h1;
pub mod proxy;

use std::future::Future;

use bytes::Bytes;
use http::{Method, Uri};

use crate::error::{Error, Result};
use crate::instrument::Capture;
use crate::options::ClientOptions;
use crate::request::Request;
use crate::response::ResponseHead;
use connector::{MaybeHttpsStream, TlsConnector};
use dialer::Dialer;
use h1::H1Connection;

/// Executes one request and returns the response head with an unread body.
///
/// Implementations must pass `capture` to every dial so the instrumentation
/// hooks in `options` record into the calling knock.
pub trait Transport: Send + Sync {
    fn send<'a>(
        &'a self,
        target_url: &'a str,
        request: &'a Request,
        body: Bytes,
        options: &'a ClientOptions,
        capture: &'a mut Capture,
    ) -> impl Future<Output = Result<(ResponseHead, Body)>> + Send + 'a;
}

/// A response body that has not been read yet. Owns the connection; dropping
/// it closes the socket.
pub struct Body {
    inner: BodyInner,
}

enum BodyInner {
    Connection(Box<H1Connection>),
    Full(Bytes),
}

impl Body {
    pub fn empty() -> Self {
        Self::from(Bytes::new())
    }

    /// Read the remaining body to the end.
    pub async fn read_all(self) -> Result<Bytes> {
        match self.inner {
            BodyInner::Connection(mut conn) => conn.read_body().await,
            BodyInner::Full(bytes) => Ok(bytes),
        }
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self {
            inner: BodyInner::Full(bytes),
        }
    }
}

impl From<H1Connection> for Body {
    fn from(conn: H1Connection) -> Self {
        Self {
            inner: BodyInner::Connection(Box::new(conn)),
        }
    }
}

/// The built-in raw HTTP/1.x transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawTransport;

impl Transport for RawTransport {
    async fn send<'a>(
        &'a self,
        target_url: &'a str,
        request: &'a Request,
        body: Bytes,
        options: &'a ClientOptions,
        capture: &'a mut Capture,
    ) -> Result<(ResponseHead, Body)> {
        let mut origin: Uri = target_url
            .parse()
            .map_err(|e| Error::InvalidUrl(format!("{}: {}", target_url, e)))?;
        let mut path = request_target(request.uri());
        let mut method = request.method().clone();
        let mut body = body;
        let mut raw_bytes = options.custom_raw_bytes.clone();
        let mut redirects = 0u32;

        loop {
            let hop = Hop {
                origin: &origin,
                path: &path,
                method: &method,
                body: &body,
                raw_bytes: raw_bytes.take(),
            };
            let (head, conn) = exchange(hop, request, options, capture).await?;

            let location = if options.follow_redirects && head.is_redirect() {
                head.get_header("location").map(str::to_string)
            } else {
                None
            };
            let Some(location) = location else {
                return Ok((head, Body::from(conn)));
            };
            if redirects >= options.max_redirects {
                return Err(Error::RedirectLimit { count: redirects });
            }
            redirects += 1;

            let (next_origin, next_path) = resolve_redirect(&origin, &path, &location)?;
            tracing::debug!(
                "Redirect {} ({}): {}{} -> {}{}",
                redirects,
                head.status,
                origin,
                path,
                next_origin,
                next_path
            );
            let keeps_method = method == Method::GET || method == Method::HEAD;
            if head.status == 303 || (matches!(head.status, 301 | 302) && !keeps_method) {
                method = Method::GET;
                body = Bytes::new();
            }
            origin = next_origin;
            path = next_path;
        }
    }
}

/// One request/response exchange on a fresh connection.
struct Hop<'a> {
    origin: &'a Uri,
    path: &'a str,
    method: &'a Method,
    body: &'a Bytes,
    raw_bytes: Option<Bytes>,
}

async fn exchange(
    hop: Hop<'_>,
    request: &Request,
    options: &ClientOptions,
    capture: &mut Capture,
) -> Result<(ResponseHead, H1Connection)> {
    let https = hop.origin.scheme_str() == Some("https");
    let host = hop
        .origin
        .host()
        .ok_or_else(|| Error::InvalidUrl(format!("missing host in {}", hop.origin)))?;
    let port = hop.origin.port_u16().unwrap_or(if https { 443 } else { 80 });
    let authority = format!("{}:{}", host, port);
    let dialer = Dialer::new(options, request);

    let (stream, target) = match &options.proxy {
        Some(proxy_url) => {
            let (proxy_host, proxy_port) = proxy::proxy_endpoint(proxy_url)?;
            let mut tcp = dialer
                .dial(&proxy_host, proxy_port, options.proxy_dial_timeout, capture)
                .await?;
            if https {
                proxy::tunnel(&mut tcp, &authority).await?;
                (tcp, hop.path.to_string())
            } else {
                // Absolute-form request target for plain HTTP through a proxy.
                (tcp, format!("http://{}{}", authority, hop.path))
            }
        }
        None => (
            dialer.dial(host, port, options.timeout, capture).await?,
            hop.path.to_string(),
        ),
    };

    let stream = if https {
        let tls = TlsConnector::new()?;
        MaybeHttpsStream::Https(tls.handshake(stream, host, &options.sni).await?)
    } else {
        MaybeHttpsStream::Http(stream)
    };

    let bytes = match hop.raw_bytes {
        Some(raw) => raw.to_vec(),
        None => {
            let headers = effective_headers(request, options, host, port, https, hop.body);
            h1::build_request(hop.method, &target, request.http_version(), &headers, hop.body)
        }
    };

    let mut conn = H1Connection::new(stream);
    conn.write_request(&bytes).await?;
    let effective_url = format!("{}{}", origin_string(hop.origin), hop.path);
    let head = conn.read_head(hop.method, &effective_url).await?;
    Ok((head, conn))
}

/// Request headers with option headers and automatic headers applied.
fn effective_headers(
    request: &Request,
    options: &ClientOptions,
    host: &str,
    port: u16,
    https: bool,
    body: &Bytes,
) -> Vec<(String, String)> {
    let mut headers = request.headers().to_vec();

    for (name, value) in &options.custom_headers {
        match headers.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(name)) {
            Some(existing) => existing.1 = value.clone(),
            None => headers.push((name.clone(), value.clone())),
        }
    }

    let has = |headers: &[(String, String)], name: &str| {
        headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    };

    if options.automatic_host_header && !has(&headers, "host") {
        let default_port = if https { 443 } else { 80 };
        let value = if port == default_port {
            host.to_string()
        } else {
            format!("{}:{}", host, port)
        };
        headers.insert(0, ("Host".to_string(), value));
    }

    if options.automatic_content_length
        && !body.is_empty()
        && !has(&headers, "content-length")
        && !has(&headers, "transfer-encoding")
    {
        headers.push(("Content-Length".to_string(), body.len().to_string()));
    }

    headers
}

fn request_target(uri: &str) -> String {
    if uri.is_empty() {
        "/".to_string()
    } else {
        uri.to_string()
    }
}

fn origin_string(origin: &Uri) -> String {
    format!(
        "{}://{}",
        origin.scheme_str().unwrap_or("http"),
        origin.authority().map(|a| a.as_str()).unwrap_or_default()
    )
}

/// Resolve a `Location` against the current URL into (origin, path).
fn resolve_redirect(origin: &Uri, path: &str, location: &str) -> Result<(Uri, String)> {
    let base = url::Url::parse(&format!("{}{}", origin_string(origin), path))
        .or_else(|_| url::Url::parse(&format!("{}/", origin_string(origin))))
        .map_err(|e| Error::InvalidRedirectUrl(format!("{}: {}", location, e)))?;
    let next = base
        .join(location)
        .map_err(|e| Error::InvalidRedirectUrl(format!("{}: {}", location, e)))?;

    if !matches!(next.scheme(), "http" | "https") {
        return Err(Error::InvalidRedirectUrl(location.to_string()));
    }
    let host = next
        .host_str()
        .ok_or_else(|| Error::InvalidRedirectUrl(location.to_string()))?;
    let port = next
        .port_or_known_default()
        .ok_or_else(|| Error::InvalidRedirectUrl(location.to_string()))?;

    let next_origin: Uri = format!("{}://{}:{}", next.scheme(), host, port)
        .parse()
        .map_err(|e| Error::InvalidRedirectUrl(format!("{}: {}", location, e)))?;
    let mut next_path = next.path().to_string();
    if let Some(query) = next.query() {
        next_path.push('?');
        next_path.push_str(query);
    }
    Ok((next_origin, next_path))
}
