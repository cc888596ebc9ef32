//! The knock orchestrator.

use std::any::Any;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::{timeout_at, Instant};

use crate::error::{Error, KnockError, Result};
use crate::instrument::{capture_remote_addr, Capture, LocalAddrMiddleware};
use crate::interface::{InterfaceResolver, SystemInterfaces};
use crate::options::{self, ClientOptions, KnockOption};
use crate::request::Request;
use crate::response::Response;
use crate::snapshot::{ConnectionInfo, Snapshot};
use crate::transport::{RawTransport, Transport};

/// Event source for remote address resolution failures.
pub const SOURCE_REMOTE_ADDR: &str = "ConnectionInfo::RemoteAddr";
/// Event source for interface lookup failures.
pub const SOURCE_NET_INTERFACE: &str = "ConnectionInfo::NetInterface";
/// Event source for transport failures.
pub const SOURCE_KNOCK: &str = "Knock";
/// Event source for body read failures.
pub const SOURCE_READ_BODY: &str = "Knock::ReadBody";

/// Sends instrumented raw requests.
///
/// Immutable after construction and safe to share between tasks: every knock
/// resolves its own options and records into its own snapshot.
#[derive(Clone)]
pub struct Client<T = RawTransport> {
    defaults: ClientOptions,
    options: Vec<KnockOption>,
    transport: T,
    resolver: Arc<dyn InterfaceResolver>,
}

impl Client<RawTransport> {
    /// Create a client with baseline settings plus `options` applied to every knock.
    pub fn new(options: impl IntoIterator<Item = KnockOption>) -> Self {
        Self::with_transport(RawTransport, options)
    }
}

impl Default for Client<RawTransport> {
    fn default() -> Self {
        Self::new([])
    }
}

impl<T: Transport> Client<T> {
    /// Create a client sending through a custom transport.
    pub fn with_transport(transport: T, options: impl IntoIterator<Item = KnockOption>) -> Self {
        Self {
            defaults: ClientOptions::default(),
            options: options.into_iter().collect(),
            transport,
            resolver: Arc::new(SystemInterfaces),
        }
    }

    /// Replace the interface resolver.
    pub fn with_resolver(mut self, resolver: impl InterfaceResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Client-level options, applied before call-level ones.
    pub fn options(&self) -> &[KnockOption] {
        &self.options
    }

    /// Send `request` to `host:port` and collect connection diagnostics.
    ///
    /// The snapshot is returned in every case; on failure it travels inside
    /// the [`KnockError`]. Only configuration errors, transport failures and
    /// internal panics fail the call. Address, interface and body read
    /// problems are recorded as events on the snapshot.
    pub async fn knock(
        &self,
        host: &str,
        port: u16,
        use_https: bool,
        request: Request,
        options: &[KnockOption],
    ) -> std::result::Result<Snapshot, KnockError> {
        let mut snapshot = Snapshot::new(request);
        // Lives outside the guarded future so hooks that fired before a panic
        // still reach the snapshot.
        let mut capture = Capture::new();

        let run = self.run(&mut snapshot, &mut capture, host, port, use_https, options);
        let outcome = AssertUnwindSafe(run).catch_unwind().await;

        match outcome {
            Ok(Ok(())) => Ok(snapshot),
            Ok(Err(e)) => Err(KnockError::new(e, snapshot)),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("knock to {}:{} panicked: {}", host, port, message);
                if !capture.is_empty() {
                    record_capture(snapshot.connection_mut(), capture);
                }
                Err(KnockError::new(Error::Unexpected(message), snapshot))
            }
        }
    }

    async fn run(
        &self,
        snapshot: &mut Snapshot,
        capture: &mut Capture,
        host: &str,
        port: u16,
        use_https: bool,
        call_options: &[KnockOption],
    ) -> Result<()> {
        let target = target_url(use_https, host, port);

        let mut options = options::resolve(&self.defaults, self.options.iter().chain(call_options))
            .map_err(|(_, e)| Error::Config(e))?;
        options.control = Some(capture_remote_addr);
        options.middlewares.push(Arc::new(LocalAddrMiddleware));

        let request = snapshot.request().clone();
        let body = request.body_bytes().cloned().unwrap_or_default();
        let deadline = Instant::now() + options.timeout;
        options.deadline = Some(deadline);

        tracing::debug!("knocking {} {}{}", request.method(), target, request.uri());
        let sent = timeout_at(
            deadline,
            self.transport.send(&target, &request, body, &options, capture),
        )
        .await
        .unwrap_or(Err(Error::Timeout(options.timeout)));

        let ci = snapshot.connection_mut();
        record_capture(ci, std::mem::take(capture));

        if let Some(first) = ci.local_addrs.first() {
            match self.resolver.query(first.ip()) {
                Ok(iface) => ci.interface = Some(iface),
                Err(e) => ci.log(SOURCE_NET_INTERFACE, e.to_string()),
            }
        }

        let (head, body) = match sent {
            Ok(sent) => sent,
            Err(e) => {
                tracing::warn!("knock {} failed: {}", target, e);
                ci.log(SOURCE_KNOCK, e.to_string());
                ci.error = Some(e.to_string());
                return Err(e);
            }
        };

        let read = timeout_at(deadline, body.read_all())
            .await
            .unwrap_or(Err(Error::Timeout(options.timeout)));
        match read {
            Ok(bytes) => snapshot.set_response(Response::new(head, bytes)),
            Err(e) => {
                let message = format!("<Knock::ReadBody> {}", e);
                let ci = snapshot.connection_mut();
                ci.log(SOURCE_READ_BODY, message.clone());
                ci.error = Some(message);
            }
        }
        Ok(())
    }
}

/// Move the hook recordings into `ci`, logging an unusable remote address.
fn record_capture(ci: &mut ConnectionInfo, capture: Capture) {
    let (remote, local_addrs) = capture.into_parts();
    ci.local_addrs = local_addrs;

    match remote.as_deref().map(str::parse::<SocketAddr>) {
        Some(Ok(addr)) => ci.remote_addr = Some(addr),
        Some(Err(e)) => ci.log(SOURCE_REMOTE_ADDR, e.to_string()),
        None => ci.log(SOURCE_REMOTE_ADDR, "no remote address was dialed"),
    }
}

/// `scheme://host:port`; IPv6 literals are bracketed.
pub fn target_url(use_https: bool, host: &str, port: u16) -> String {
    let scheme = if use_https { "https" } else { "http" };
    if host.contains(':') && !host.starts_with('[') {
        format!("{}://[{}]:{}", scheme, host, port)
    } else {
        format!("{}://{}:{}", scheme, host, port)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_url_scheme() {
        assert_eq!(target_url(false, "example.com", 80), "http://example.com:80");
        assert_eq!(target_url(true, "example.com", 8443), "https://example.com:8443");
    }

    #[test]
    fn test_target_url_brackets_ipv6() {
        assert_eq!(target_url(false, "::1", 8080), "http://[::1]:8080");
        assert_eq!(target_url(true, "[::1]", 443), "https://[::1]:443");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(payload.as_ref()), "panic with non-string payload");
    }

    #[test]
    fn test_client_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Client>();
    }
}
