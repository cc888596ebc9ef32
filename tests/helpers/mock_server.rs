use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use boring::ssl::{NameType, SslAcceptor};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

/// Produces the raw response bytes for a request target.
pub type Handler = Arc<dyn Fn(&str) -> Vec<u8> + Send + Sync>;

/// One request as the server saw it.
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct RecordedRequest {
    pub raw: Vec<u8>,
    pub peer: SocketAddr,
    /// Server name the client sent in the TLS ClientHello.
    pub sni: Option<String>,
}

#[allow(dead_code)]
impl RecordedRequest {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.raw).to_string()
    }

    pub fn request_line(&self) -> String {
        self.text().lines().next().unwrap_or_default().to_string()
    }
}

/// A one-request-per-connection HTTP/1.1 mock server, plain or TLS.
pub struct MockHttpServer {
    listener: TcpListener,
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

#[allow(dead_code)]
impl MockHttpServer {
    /// Create a new mock server bound to a random port.
    pub async fn new() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            requests: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared log of received requests, in arrival order.
    pub fn requests(&self) -> Arc<Mutex<Vec<RecordedRequest>>> {
        Arc::clone(&self.requests)
    }

    /// Answer every request with the same bytes.
    pub fn start_static(self, response: &'static [u8]) -> tokio::task::JoinHandle<()> {
        self.start(Arc::new(move |_| response.to_vec()))
    }

    /// Serve plain HTTP in a background task.
    pub fn start(self, handler: Handler) -> tokio::task::JoinHandle<()> {
        self.run(handler, None)
    }

    /// Serve HTTPS in a background task.
    pub fn start_tls(self, acceptor: SslAcceptor, handler: Handler) -> tokio::task::JoinHandle<()> {
        self.run(handler, Some(Arc::new(acceptor)))
    }

    /// Accept connections and never answer.
    pub fn start_silent(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = self.listener.accept().await {
                held.push(stream);
            }
        })
    }

    fn run(
        self,
        handler: Handler,
        acceptor: Option<Arc<SslAcceptor>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let (stream, peer) = match self.listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::error!("Accept error: {}", e);
                        break;
                    }
                };
                let handler = Arc::clone(&handler);
                let requests = Arc::clone(&self.requests);
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    match acceptor {
                        Some(acceptor) => match tokio_boring::accept(&acceptor, stream).await {
                            Ok(tls) => {
                                let sni = tls
                                    .ssl()
                                    .servername(NameType::HOST_NAME)
                                    .map(str::to_string);
                                handle_connection(tls, peer, sni, handler, requests).await;
                            }
                            Err(e) => tracing::warn!("TLS accept error: {}", e),
                        },
                        None => handle_connection(stream, peer, None, handler, requests).await,
                    }
                });
            }
        })
    }
}

/// Read one request, answer it, close.
async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    sni: Option<String>,
    handler: Handler,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let raw = match timeout(Duration::from_secs(5), read_request(&mut stream)).await {
        Ok(Some(raw)) => raw,
        _ => return,
    };

    let text = String::from_utf8_lossy(&raw).to_string();
    let target = text
        .lines()
        .next()
        .and_then(|line| line.split(' ').nth(1))
        .unwrap_or("/")
        .to_string();

    requests.lock().unwrap().push(RecordedRequest { raw, peer, sni });

    let response = handler(&target);
    if stream.write_all(&response).await.is_err() {
        return;
    }
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}

/// Read a request head plus a `Content-Length` body.
pub async fn read_request<S: AsyncRead + Unpin>(stream: &mut S) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return if buf.is_empty() { None } else { Some(buf) };
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buf.len() < head_end + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(buf)
}

/// A complete response with a `Content-Length` body.
#[allow(dead_code)]
pub fn response(status: &str, headers: &[&str], body: &str) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\n", status);
    for header in headers {
        out.push_str(header);
        out.push_str("\r\n");
    }
    out.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()));
    out.push_str(body);
    out.into_bytes()
}
