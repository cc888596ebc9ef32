//! BoringSSL TLS connector.
//!
//! Certificates are not verified: a knock observes whatever endpoint answers,
//! including ones with self-signed or mismatched certificates.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use boring::ssl::{SslConnector, SslMethod, SslVerifyMode, SslVersion};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_boring::SslStream;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct TlsConnector {
    inner: SslConnector,
}

impl TlsConnector {
    pub fn new() -> Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| Error::tls(format!("Failed to create SSL connector: {}", e)))?;

        builder.set_verify(SslVerifyMode::NONE);
        builder
            .set_min_proto_version(Some(SslVersion::TLS1))
            .map_err(|e| Error::tls(format!("Failed to set min TLS version: {}", e)))?;
        builder
            .set_max_proto_version(Some(SslVersion::TLS1_3))
            .map_err(|e| Error::tls(format!("Failed to set max TLS version: {}", e)))?;

        // Only HTTP/1.x is spoken on the connection.
        builder
            .set_alpn_protos(b"\x08http/1.1")
            .map_err(|e| Error::tls(format!("Failed to set ALPN: {}", e)))?;

        Ok(Self {
            inner: builder.build(),
        })
    }

    /// Run the TLS handshake over an established TCP stream.
    ///
    /// The server name is `sni` when non-empty, else `host`. IP literals are
    /// never sent as SNI.
    pub async fn handshake(
        &self,
        stream: TcpStream,
        host: &str,
        sni: &str,
    ) -> Result<SslStream<TcpStream>> {
        let server_name = server_name(host, sni);

        let mut config = self
            .inner
            .configure()
            .map_err(|e| Error::tls(format!("Failed to configure SSL: {}", e)))?;
        config.set_verify_hostname(false);
        config.set_use_server_name_indication(server_name.is_some());

        let domain = server_name.unwrap_or(host);
        tokio_boring::connect(config, domain, stream)
            .await
            .map_err(|e| Error::tls(format!("TLS handshake failed: {}", e)))
    }
}

/// SNI to send, if any.
fn server_name<'a>(host: &'a str, sni: &'a str) -> Option<&'a str> {
    if !sni.is_empty() {
        return Some(sni);
    }
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok() {
        None
    } else {
        Some(host)
    }
}

#[derive(Debug)]
pub enum MaybeHttpsStream {
    Http(TcpStream),
    Https(SslStream<TcpStream>),
}

impl MaybeHttpsStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Https(_))
    }
}

impl AsyncRead for MaybeHttpsStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_read(cx, buf),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MaybeHttpsStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_write(cx, buf),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_flush(cx),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            MaybeHttpsStream::Http(stream) => Pin::new(stream).poll_shutdown(cx),
            MaybeHttpsStream::Https(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
