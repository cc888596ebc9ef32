//! TCP dialer with instrumentation hook points.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpStream};
use tokio::task;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::instrument::Capture;
use crate::options::ClientOptions;
use crate::request::Request;

/// Finalized parameters of an established dial, handed to middlewares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialOptions {
    /// `"tcp4"` or `"tcp6"`.
    pub network: &'static str,
    pub remote_addr: SocketAddr,
    /// Address the OS bound the socket to, if it could be read.
    pub local_addr: Option<SocketAddr>,
    pub timeout: Duration,
}

/// Dials TCP connections, firing the dial-control hook before every connect
/// attempt and the middlewares after a successful one.
pub struct Dialer<'a> {
    options: &'a ClientOptions,
    request: &'a Request,
}

impl<'a> Dialer<'a> {
    pub fn new(options: &'a ClientOptions, request: &'a Request) -> Self {
        Self { options, request }
    }

    /// Resolve `host` and connect to the first address that accepts.
    pub async fn dial(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
        capture: &mut Capture,
    ) -> Result<TcpStream> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let addrs: Vec<SocketAddr> = lookup_host((host, port))
            .await
            .map_err(|e| Error::connection(format!("DNS resolution failed for {}: {}", host, e)))?
            .collect();
        if addrs.is_empty() {
            return Err(Error::connection(format!("No addresses found for {}", host)));
        }

        let mut last_err = None;
        for addr in addrs {
            let network = if addr.is_ipv4() { "tcp4" } else { "tcp6" };
            if let Some(control) = self.options.control {
                control(capture, network, &addr.to_string());
            }
            tracing::debug!("Dialing {} ({})", addr, network);

            let attempt = match self.options.deadline {
                Some(deadline) => timeout.min(deadline.saturating_duration_since(Instant::now())),
                None => timeout,
            };
            if attempt.is_zero() {
                return Err(Error::ConnectTimeout(timeout));
            }

            match connect(addr, self.options.source_addr, attempt).await {
                Ok((stream, local_addr)) => {
                    let dial = DialOptions {
                        network,
                        remote_addr: addr,
                        local_addr,
                        timeout,
                    };
                    for middleware in &self.options.middlewares {
                        middleware.on_dialed(capture, self.options, &dial, self.request);
                    }
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!("Connect to {} failed: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::connection("no address attempted")))
    }
}

/// Connect one socket, optionally bound to `source`.
///
/// Blocking connect with timeout runs on the blocking pool; the connected
/// socket is handed to tokio afterwards.
async fn connect(
    addr: SocketAddr,
    source: Option<SocketAddr>,
    timeout: Duration,
) -> Result<(TcpStream, Option<SocketAddr>)> {
    let blocking = move || -> Result<(std::net::TcpStream, Option<SocketAddr>)> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::connection(format!("Failed to create socket: {}", e)))?;

        if let Some(source) = source {
            socket.bind(&source.into()).map_err(|e| {
                Error::connection(format!("Failed to bind source address {}: {}", source, e))
            })?;
        }

        socket.connect_timeout(&addr.into(), timeout).map_err(|e| {
            if e.kind() == io::ErrorKind::TimedOut {
                Error::ConnectTimeout(timeout)
            } else {
                Error::connection(format!("Failed to connect to {}: {}", addr, e))
            }
        })?;

        socket
            .set_nonblocking(true)
            .map_err(|e| Error::connection(format!("Failed to set non-blocking: {}", e)))?;

        let local = socket.local_addr().ok().and_then(|a| a.as_socket());
        Ok((socket.into(), local))
    };
    let (std_stream, local) = task::spawn_blocking(blocking)
        .await
        .map_err(|e| Error::connection(format!("Blocking task failed: {}", e)))??;

    let stream = TcpStream::from_std(std_stream).map_err(|e| {
        Error::connection(format!("Failed to convert to tokio stream: {}", e))
    })?;
    Ok((stream, local))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{capture_remote_addr, LocalAddrMiddleware};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn instrumented() -> ClientOptions {
        let mut opts = ClientOptions::default();
        opts.control = Some(capture_remote_addr);
        opts.middlewares.push(Arc::new(LocalAddrMiddleware));
        opts
    }

    #[tokio::test]
    async fn test_dial_fires_hooks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let opts = instrumented();
        let request = Request::get("/");
        let mut capture = Capture::new();

        let stream = Dialer::new(&opts, &request)
            .dial("127.0.0.1", port, Duration::from_secs(2), &mut capture)
            .await
            .unwrap();

        assert_eq!(capture.remote_addr(), Some(format!("127.0.0.1:{}", port).as_str()));
        assert_eq!(capture.local_addrs(), &[stream.local_addr().unwrap()]);
    }

    #[tokio::test]
    async fn test_refused_dial_captures_remote_only() {
        // Bind then drop to get a port with nothing listening.
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let opts = instrumented();
        let request = Request::get("/");
        let mut capture = Capture::new();

        let err = Dialer::new(&opts, &request)
            .dial("127.0.0.1", port, Duration::from_secs(2), &mut capture)
            .await
            .unwrap_err();

        assert!(err.is_connection());
        assert!(capture.remote_addr().is_some());
        assert!(capture.local_addrs().is_empty());
    }

    #[tokio::test]
    async fn test_dial_binds_source_addr() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut opts = instrumented();
        opts.source_addr = Some("127.0.0.1:0".parse().unwrap());
        let request = Request::get("/");
        let mut capture = Capture::new();

        Dialer::new(&opts, &request)
            .dial("127.0.0.1", port, Duration::from_secs(2), &mut capture)
            .await
            .unwrap();

        assert_eq!(capture.local_addrs()[0].ip().to_string(), "127.0.0.1");
    }

    #[tokio::test]
    async fn test_dial_stops_at_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut opts = instrumented();
        opts.deadline = Some(Instant::now());
        let request = Request::get("/");
        let mut capture = Capture::new();

        let err = Dialer::new(&opts, &request)
            .dial("127.0.0.1", port, Duration::from_secs(2), &mut capture)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::ConnectTimeout(_)));
        assert!(capture.remote_addr().is_some());
        assert!(capture.local_addrs().is_empty());
    }
}
