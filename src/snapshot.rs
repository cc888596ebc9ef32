//! The result of a knock.
//!
//! A [`Snapshot`] is returned from every knock, successful or not. Failures
//! that do not abort the call are recorded as [`Event`]s on the
//! [`ConnectionInfo`] instead of being returned.

use std::net::SocketAddr;

use serde::Serialize;

use crate::error::Result;
use crate::interface::NetInterface;
use crate::request::Request;
use crate::response::Response;

/// One diagnostic log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub source: String,
    pub message: String,
}

/// Diagnostics about the physical connection.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionInfo {
    pub(crate) local_addrs: Vec<SocketAddr>,
    pub(crate) remote_addr: Option<SocketAddr>,
    pub(crate) interface: Option<NetInterface>,
    pub(crate) error: Option<String>,
    events: Vec<Event>,
}

impl ConnectionInfo {
    /// Local addresses of every dial, in order.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Address of the last socket dialed (the proxy when one is used).
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Interface owning the first local address.
    pub fn interface(&self) -> Option<&NetInterface> {
        self.interface.as_ref()
    }

    /// Terminal connection error or body read failure.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// Events logged under `source`.
    pub fn events_from<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a Event> + 'a {
        self.events.iter().filter(move |e| e.source == source)
    }

    pub(crate) fn log(&mut self, source: &str, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(source, %message, "knock event");
        self.events.push(Event {
            source: source.to_string(),
            message,
        });
    }
}

/// Request, response and connection diagnostics of one knock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    request: Request,
    #[serde(rename = "connection_info")]
    connection: ConnectionInfo,
    response: Option<Response>,
}

impl Snapshot {
    pub(crate) fn new(request: Request) -> Self {
        Self {
            request,
            connection: ConnectionInfo::default(),
            response: None,
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.connection
    }

    /// Present only when the exchange succeeded and the body was read.
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    pub fn into_response(self) -> Option<Response> {
        self.response
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub(crate) fn connection_mut(&mut self) -> &mut ConnectionInfo {
        &mut self.connection
    }

    pub(crate) fn set_response(&mut self, response: Response) {
        self.response = Some(response);
    }
}
