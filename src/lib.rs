#![deny(unsafe_code)]

//! Reconnecting JSON-RPC 1.0 transport over byte streams.
//!
//! Three layers, bottom up:
//!
//! - [`Message`]: the JSON-RPC 1.0 message model and codec. Requests,
//!   notifications, replies, and errors, with the shape rules of each
//!   enforced by construction and checked on decode.
//! - [`Connection`]: one byte-stream [`Transport`] plus a non-blocking
//!   send queue with backlog accounting, an incremental decode of the
//!   inbound byte stream, and a latched terminal [`Fault`]. Async
//!   wrappers ([`Connection::send_all`], [`Connection::recv`],
//!   [`Connection::transact`]) loop the non-blocking core over readiness.
//! - [`Session`]: an always-available logical connection. Reconnects with
//!   exponential backoff, probes an idle peer with `echo` requests,
//!   answers the peer's probes, and bumps a sequence number on every
//!   connectivity transition so callers can tell the stream underneath
//!   them was replaced.
//!
//! Messages travel as concatenated JSON objects with no framing
//! delimiter; the decoder finds the end of each value itself.
//!
//! ```ignore
//! let mut session = Session::open("tcp:127.0.0.1:6640");
//! loop {
//!     session.run();
//!     while let Some(msg) = session.recv() {
//!         handle(&mut session, msg);
//!     }
//!     session.wait().await;
//! }
//! ```

pub mod connection;
pub mod mem;
pub mod msg;
pub mod reconnect;
pub mod session;
pub mod transport;

mod throttle;

pub use connection::{Connection, Fault};
pub use msg::Message;
pub use reconnect::{Command, Policy, Reconnect};
pub use session::{Session, SessionError};
pub use transport::Transport;
