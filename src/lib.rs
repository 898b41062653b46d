//! A Scalability Protocols transport core, over TLS-over-TCP.
//!
//! ## What This Is
//!
//! Scalability Protocols (SP) — the messaging style behind nanomsg and
//! NNG — multiplex message-oriented pipes over an ordinary stream
//! transport, handing applications a small socket-style API
//! (`send`/`recv`, dial/listen) while hiding connection management,
//! reconnection, and framing. This crate implements that transport core
//! for one concrete stream: TLS over TCP.
//!
//! ## Layout
//!
//! - [`aio`] — the single-completion, cancellable, timeout-aware async
//!   I/O primitive every blocking operation in this crate is built from.
//! - [`stream`] — the TCP/TLS byte-stream providers pipes are built on.
//! - [`pipe`] — one negotiated SP connection: framing, send/recv queues.
//! - [`endpoint`] — per-dialer/per-listener state: the accept/connect
//!   loop, reconnection backoff, and matching negotiated pipes to a
//!   waiting caller.
//! - [`socket`] — the synchronous send/recv surface applications use,
//!   plus the option table.
//! - [`protocol`] — the pluggable multiplexing policy above pipes.
//!
//! ### Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sp_transport::{Message, Socket};
//! use sp_transport::protocol::RawPairProtocol;
//!
//! # async fn run(server_cfg: Arc<rustls::ServerConfig>, client_cfg: Arc<rustls::ClientConfig>) -> sp_transport::Result<()> {
//! let server = Socket::new(Arc::new(RawPairProtocol::new()));
//! let id = server.listen("tls+tcp://127.0.0.1:0", server_cfg)?;
//! server.start_listener(id)?;
//!
//! let client = Socket::new(Arc::new(RawPairProtocol::new()));
//! let id = client.dial("tls+tcp://127.0.0.1:9443", client_cfg)?;
//! client.start_dialer(id)?;
//!
//! client.send(Message::from_body(&b"hello"[..])).await?;
//! let reply = server.recv().await?;
//! assert_eq!(reply.body(), b"hello");
//! # Ok(())
//! # }
//! ```

#![deny(missing_debug_implementations)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::use_self)]

pub mod addr;
pub mod aio;
pub mod clock;
pub mod endpoint;
pub mod error;
pub mod message;
pub mod options;
pub mod pipe;
pub mod protocol;
pub mod reap;
pub mod socket;
pub mod stream;
pub mod url;

#[cfg(test)]
mod test_support;

pub use crate::{
    aio::{Aio, AioResult},
    endpoint::{Endpoint, EndpointId},
    error::{Error, Result},
    message::Message,
    pipe::Pipe,
    socket::Socket,
};
