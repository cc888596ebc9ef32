use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use super::mock_server::read_request;

/// A forward HTTP proxy that records the first line of every request.
///
/// `CONNECT` requests are tunneled to their authority. Anything else is
/// answered directly with `200 proxied`.
pub struct MockProxy {
    listener: TcpListener,
    addr: SocketAddr,
    seen: Arc<Mutex<Vec<String>>>,
}

#[allow(dead_code)]
impl MockProxy {
    pub async fn new() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            seen: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn seen(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.seen)
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok((stream, _)) = self.listener.accept().await {
                tokio::spawn(handle(stream, Arc::clone(&self.seen)));
            }
        })
    }
}

async fn handle(mut client: TcpStream, seen: Arc<Mutex<Vec<String>>>) {
    let Some(raw) = read_request(&mut client).await else {
        return;
    };
    let text = String::from_utf8_lossy(&raw).to_string();
    let line = text.lines().next().unwrap_or_default().to_string();
    seen.lock().unwrap().push(line.clone());

    let mut parts = line.split(' ');
    if parts.next() == Some("CONNECT") {
        let authority = parts.next().unwrap_or_default().to_string();
        let Ok(mut upstream) = TcpStream::connect(&authority).await else {
            let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
            return;
        };
        if client
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await
            .is_err()
        {
            return;
        }
        let _ = tokio::io::copy_bidirectional(&mut client, &mut upstream).await;
    } else {
        let _ = client
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\nConnection: close\r\n\r\nproxied")
            .await;
    }
}
