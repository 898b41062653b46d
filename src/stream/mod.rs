//! Stream providers: opaque bidirectional byte streams consumed by pipes.
//!
//! A [`Stream`] contract (spec §3/§4.2): `send`/`recv` each move at least
//! one byte or error; both are cancel-safe; `close` is idempotent and
//! causes in-flight operations to complete with a closed error. This crate
//! has exactly one real implementor, [`tls::TlsConn`], layered over a plain
//! [`tokio::net::TcpStream`] dialed/accepted via [`tcp::dial`] — but the
//! trait boundary is what lets `pipe.rs` stay ignorant of TLS entirely.

pub mod tcp;
pub mod tls;

use std::io;

use async_trait::async_trait;

use crate::addr::SocketAddr;

/// An opaque bidirectional byte stream.
///
/// Implementations must be safe to call `send`/`recv` on concurrently with
/// `close` from another task; a `close` must cause any in-flight operation
/// to return an error promptly rather than hang.
#[async_trait]
pub trait Stream: Send + Sync {
    /// Writes from `bufs` (scatter-gather), returning the number of bytes
    /// actually written. May transfer fewer bytes than requested; the
    /// caller resubmits the remainder (spec §4.3 "Partial I/O").
    async fn send(&self, bufs: &[io::IoSlice<'_>]) -> io::Result<usize>;

    /// Reads into `bufs` (scatter-gather), returning the number of bytes
    /// actually read. `0` means the peer closed the stream.
    async fn recv(&self, bufs: &mut [io::IoSliceMut<'_>]) -> io::Result<usize>;

    /// Idempotently closes the stream. Any operation racing with `close`
    /// completes with an error.
    fn close(&self);

    /// The remote peer's address, if known.
    fn remote_addr(&self) -> SocketAddr;

    /// `true` if this stream authenticated its peer (TLS connections that
    /// completed a handshake with a verified certificate).
    fn verified(&self) -> bool {
        false
    }
}
