//! # Knock
//!
//! A single instrumented raw HTTP/HTTPS request.
//!
//! [`Client::knock`] writes a request to the wire exactly as given and returns
//! a [`Snapshot`]: the request, the response if one was read, and
//! [`ConnectionInfo`] describing the physical connection (local and remote
//! addresses, the network interface used, and a log of diagnostic events).
//!
//! ```no_run
//! use knock::{Client, KnockOption, Request};
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), knock::KnockError> {
//! let client = Client::new([KnockOption::Timeout(Duration::from_secs(3))]);
//! let snapshot = client
//!     .knock("example.com", 443, true, Request::get("/"), &[])
//!     .await?;
//! println!("{:?}", snapshot.connection_info().remote_addr());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod instrument;
pub mod interface;
pub mod options;
pub mod request;
pub mod response;
pub mod snapshot;
pub mod transport;

// Re-exports
pub use client::{target_url, Client};
pub use error::{ConfigError, Error, KnockError, Result};
pub use instrument::{Capture, DialControl, Middleware};
pub use interface::{InterfaceError, InterfaceResolver, NetInterface, SystemInterfaces};
pub use options::{ClientOptions, KnockOption};
pub use request::Request;
pub use response::{Response, ResponseHead};
pub use snapshot::{ConnectionInfo, Event, Snapshot};
pub use transport::{Body, RawTransport, Transport};
