//! Connection instrumentation hooks.
//!
//! Each knock allocates its own [`Capture`] and passes it by `&mut` through
//! the transport to the dialer. Hooks only ever see that buffer, so concurrent
//! knocks on one client cannot observe each other's addresses.

use std::net::SocketAddr;

use crate::options::ClientOptions;
use crate::request::Request;
use crate::transport::dialer::DialOptions;

/// Addresses recorded by the hooks during one knock.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Capture {
    remote_addr: Option<String>,
    local_addrs: Vec<SocketAddr>,
}

impl Capture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last remote address string handed to the dial-control hook.
    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    /// Local addresses appended by middlewares, in dial order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn set_remote_addr(&mut self, address: impl Into<String>) {
        self.remote_addr = Some(address.into());
    }

    pub fn push_local_addr(&mut self, addr: SocketAddr) {
        self.local_addrs.push(addr);
    }

    /// True when no hook has recorded anything yet.
    pub fn is_empty(&self) -> bool {
        self.remote_addr.is_none() && self.local_addrs.is_empty()
    }

    pub(crate) fn into_parts(self) -> (Option<String>, Vec<SocketAddr>) {
        (self.remote_addr, self.local_addrs)
    }
}

/// Dial-control hook, called before each connect attempt with the network
/// (`"tcp4"`/`"tcp6"`) and the `ip:port` being connected to.
pub type DialControl = fn(capture: &mut Capture, network: &str, address: &str);

/// Post-dial hook. Sees the finalized dial options of an established
/// connection; it cannot modify the request.
pub trait Middleware: Send + Sync {
    fn on_dialed(
        &self,
        capture: &mut Capture,
        options: &ClientOptions,
        dial: &DialOptions,
        request: &Request,
    );
}

/// Records the dialed address.
pub fn capture_remote_addr(capture: &mut Capture, _network: &str, address: &str) {
    capture.set_remote_addr(address);
}

/// Appends the local address the OS chose, when the dialer exposes one.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalAddrMiddleware;

impl Middleware for LocalAddrMiddleware {
    fn on_dialed(
        &self,
        capture: &mut Capture,
        _options: &ClientOptions,
        dial: &DialOptions,
        _request: &Request,
    ) {
        if let Some(local) = dial.local_addr {
            capture.push_local_addr(local);
        }
    }
}
