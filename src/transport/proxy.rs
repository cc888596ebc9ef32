//! HTTP proxy support.
//!
//! Plain-HTTP targets are sent to the proxy in absolute-form. HTTPS targets
//! go through a `CONNECT` tunnel, then TLS runs inside it.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::transport::h1::find_header_end;

/// Maximum size of the proxy's CONNECT response head.
const MAX_TUNNEL_RESPONSE: usize = 16 * 1024;

/// Host and port of a proxy URL.
pub fn proxy_endpoint(proxy: &url::Url) -> Result<(String, u16)> {
    let host = proxy
        .host_str()
        .ok_or_else(|| Error::proxy(format!("proxy URL has no host: {}", proxy)))?;
    let port = proxy.port_or_known_default().unwrap_or(8080);
    Ok((host.to_string(), port))
}

/// Establish a `CONNECT` tunnel to `authority` (`host:port`).
pub async fn tunnel(stream: &mut TcpStream, authority: &str) -> Result<()> {
    let connect = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n\r\n"
    );
    stream
        .write_all(connect.as_bytes())
        .await
        .map_err(|e| Error::proxy(format!("Failed to write CONNECT: {}", e)))?;

    let mut buffer = Vec::with_capacity(1024);
    let mut read_buf = [0u8; 1024];
    let head_len = loop {
        if let Some(end) = find_header_end(&buffer) {
            break end;
        }
        if buffer.len() >= MAX_TUNNEL_RESPONSE {
            return Err(Error::proxy("CONNECT response headers too large"));
        }
        let n = stream
            .read(&mut read_buf)
            .await
            .map_err(|e| Error::proxy(format!("Failed to read CONNECT response: {}", e)))?;
        if n == 0 {
            return Err(Error::proxy("Proxy closed connection during CONNECT"));
        }
        buffer.extend_from_slice(&read_buf[..n]);
    };

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    response
        .parse(&buffer[..head_len])
        .map_err(|e| Error::proxy(format!("Malformed CONNECT response: {}", e)))?;

    match response.code {
        Some(code) if (200..300).contains(&code) => {
            tracing::debug!("Proxy tunnel to {} established", authority);
            Ok(())
        }
        Some(code) => Err(Error::proxy(format!(
            "CONNECT {} rejected with status {} {}",
            authority,
            code,
            response.reason.unwrap_or("")
        ))),
        None => Err(Error::proxy("CONNECT response missing status")),
    }
}
