//! # wick
//!
//! A single-threaded, event-driven HTTP/1.1 server.
//!
//! One reactor thread owns a readiness selector and every connection: raw
//! TCP or TLS transports present the same callback contract, a
//! per-connection state machine parses requests incrementally out of
//! partially filled buffers, and responses stream back through scatter
//! buffer chains under backpressure.
//!
//! The usual entry point is [`server::Server`]: register handlers, then
//! `listen_and_serve`. The lower layers ([`reactor`], [`conn`], [`buf`])
//! are public for callers that want to drive sockets directly.

#[macro_use]
extern crate log;

pub use crate::error::{Error, Result};
pub use crate::method::Method;
pub use crate::server::Server;
pub use crate::status::StatusCode;
pub use crate::version::Version;

pub mod buf;
pub mod conn;
pub mod error;
pub mod http;
pub mod method;
pub mod reactor;
pub mod server;
pub mod status;
pub mod version;

#[cfg(feature = "tls")]
pub mod tls;

#[cfg(test)]
pub mod mock;
