//! The TLS-over-TCP stream, the sole real implementor of
//! [`crate::stream::Stream`].
//!
//! The cryptographic state machine itself is `rustls`'s — an explicit
//! collaborator this crate treats as opaque (spec §1 Non-goals). This
//! module only adapts `tokio_rustls`'s `AsyncRead`/`AsyncWrite` streams to
//! the scatter-gather, `&self`-based [`Stream`] contract the rest of the
//! transport is written against, and carries the dialer/listener TLS
//! config attach points (spec §3 "Stream ... config attach/detach").

use std::convert::TryFrom;
use std::io::{self, IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::addr::SocketAddr;
use crate::error::Error;
use crate::stream::Stream;

enum Inner {
    Client(ReadHalf<client::TlsStream<TcpStream>>, WriteHalf<client::TlsStream<TcpStream>>),
    Server(ReadHalf<server::TlsStream<TcpStream>>, WriteHalf<server::TlsStream<TcpStream>>),
}

/// A TLS connection, either the client or the server side of a handshake,
/// wearing a single [`Stream`] face for the rest of the transport.
pub struct TlsConn {
    reader: AsyncMutex<HalfReader>,
    writer: AsyncMutex<HalfWriter>,
    remote: SocketAddr,
    verified: bool,
    closed: AtomicBool,
}

impl std::fmt::Debug for TlsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConn")
            .field("verified", &self.verified)
            .finish_non_exhaustive()
    }
}

enum HalfReader {
    Client(ReadHalf<client::TlsStream<TcpStream>>),
    Server(ReadHalf<server::TlsStream<TcpStream>>),
}

enum HalfWriter {
    Client(WriteHalf<client::TlsStream<TcpStream>>),
    Server(WriteHalf<server::TlsStream<TcpStream>>),
}

impl TlsConn {
    fn new(inner: Inner, remote: SocketAddr, verified: bool) -> Self {
        let (reader, writer) = match inner {
            Inner::Client(r, w) => (HalfReader::Client(r), HalfWriter::Client(w)),
            Inner::Server(r, w) => (HalfReader::Server(r), HalfWriter::Server(w)),
        };
        Self {
            reader: AsyncMutex::new(reader),
            writer: AsyncMutex::new(writer),
            remote,
            verified,
            closed: AtomicBool::new(false),
        }
    }

    /// Performs the client side of a handshake: dials nothing itself
    /// (the caller supplies an already-connected `TcpStream`) and drives
    /// `rustls` to completion under `server_name`.
    pub async fn connect(
        tcp: TcpStream,
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<Self, Error> {
        let remote = tcp
            .peer_addr()
            .map(SocketAddr::from)
            .unwrap_or(SocketAddr::Unspecified);
        let connector = TlsConnector::from(config);
        let name = rustls::ServerName::try_from(server_name)
            .map_err(|_| Error::AddressInvalid(server_name.to_string()))?;
        let stream = connector
            .connect(name, tcp)
            .await
            .map_err(classify_tls_error)?;
        let (_, conn) = stream.get_ref();
        let verified = !conn.peer_certificates().unwrap_or(&[]).is_empty();
        let (r, w) = tokio::io::split(stream);
        Ok(Self::new(Inner::Client(r, w), remote, verified))
    }

    /// Performs the server side of a handshake on an accepted `TcpStream`.
    pub async fn accept(tcp: TcpStream, config: Arc<rustls::ServerConfig>) -> Result<Self, Error> {
        let remote = tcp
            .peer_addr()
            .map(SocketAddr::from)
            .unwrap_or(SocketAddr::Unspecified);
        let acceptor = TlsAcceptor::from(config);
        let stream = acceptor.accept(tcp).await.map_err(classify_tls_error)?;
        let (_, conn) = stream.get_ref();
        let verified = !conn.peer_certificates().unwrap_or(&[]).is_empty();
        let (r, w) = tokio::io::split(stream);
        Ok(Self::new(Inner::Server(r, w), remote, verified))
    }
}

fn classify_tls_error(e: io::Error) -> Error {
    // rustls surfaces certificate failures as plain `io::Error`s wrapping
    // an `InvalidCertificate`/`General` rustls error; we don't have a
    // stable downcast across tokio-rustls versions, so fall back to a
    // string match on the well-known rustls error text for the
    // peer-authentication case and otherwise report a generic crypto
    // failure.
    let msg = e.to_string();
    if msg.contains("CertificateRequired")
        || msg.contains("InvalidCertificate")
        || msg.contains("UnknownIssuer")
        || msg.contains("certificate")
    {
        Error::PeerAuth
    } else {
        Error::Crypto(msg)
    }
}

#[async_trait]
impl Stream for TlsConn {
    async fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
        }
        let mut w = self.writer.lock().await;
        let n = match &mut *w {
            HalfWriter::Client(w) => w.write_vectored(bufs).await?,
            HalfWriter::Server(w) => w.write_vectored(bufs).await?,
        };
        Ok(n)
    }

    async fn recv(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
        }
        if bufs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "recv called with no buffers"));
        }
        // Tokio's `AsyncRead` has no vectored counterpart (unlike
        // `AsyncWrite`'s `poll_write_vectored`), so a multi-buffer request
        // is served as a single read into the first non-empty buffer — a
        // short read by design, same as a real readv would return whenever
        // the socket has less ready than the whole buffer set asks for.
        let buf = bufs
            .iter_mut()
            .find(|b| !b.is_empty())
            .unwrap_or(&mut bufs[0]);
        let mut r = self.reader.lock().await;
        let n = match &mut *r {
            HalfReader::Client(r) => r.read(buf).await?,
            HalfReader::Server(r) => r.read(buf).await?,
        };
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed the connection",
            ));
        }
        Ok(n)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote.clone()
    }

    fn verified(&self) -> bool {
        self.verified
    }
}
