//! Crate-wide error type.
//!
//! The taxonomy mirrors the SP error codes of the underlying protocol
//! (transport, protocol, resource, misuse, peer/TLS — see the module docs
//! on [`crate::aio`] and [`crate::socket`] for which operations raise which
//! variant) rather than wrapping a foreign error-code space, since there is
//! no C library on the other side of this crate to round-trip codes through.

use thiserror::Error;

/// Errors produced by this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// A synchronous call or a scheduled [`crate::aio::Aio`] exceeded its
    /// deadline before completing.
    #[error("timed out")]
    TimedOut,

    /// A non-blocking call could not complete immediately.
    #[error("operation would block")]
    WouldBlock,

    /// The object (socket, endpoint, or pipe) the caller addressed is
    /// closed.
    #[error("closed")]
    Closed,

    /// A dial attempt was actively refused by the peer.
    #[error("connection refused")]
    ConnectionRefused,

    /// The underlying stream closed while SP header negotiation was in
    /// progress. Distinguished from [`Error::Closed`] so callers can tell
    /// a mid-handshake drop from a local cancellation.
    #[error("connection shut down during negotiation")]
    ConnectionShut,

    /// The peer's SP negotiation header did not match the expected magic.
    #[error("protocol negotiation error")]
    ProtocolError,

    /// An incoming frame's length prefix exceeded the pipe's `recv-max`.
    #[error("message exceeds the receiver's maximum size")]
    MessageTooLarge,

    /// A URL failed validation (bad scheme, disallowed component, missing
    /// host/port).
    #[error("invalid address: {0}")]
    AddressInvalid(String),

    /// A listener could not bind because the address is already in use.
    #[error("address already in use")]
    AddressInUse,

    /// An option was set with a value of the wrong type.
    #[error("option has the wrong value type")]
    BadType,

    /// An option name is unknown, or is valid but not for this kind of
    /// endpoint (e.g. a reconnect interval set on a listener).
    #[error("option or operation not supported")]
    Unsupported,

    /// A handle (endpoint id, pipe) does not resolve to a live object.
    /// Also returned when a listener id is looked up as a dialer or vice
    /// versa.
    #[error("no such entity")]
    NoSuchEntity,

    /// A second `connect`/`accept` was posted to an endpoint that already
    /// has one outstanding.
    #[error("busy")]
    Busy,

    /// The call is not valid given the object's current state (e.g.
    /// starting an already-started listener).
    #[error("invalid state for this operation")]
    StateInvalid,

    /// An option value was of the right type but out of range (negative
    /// duration, oversized `recv-max`, negative buffer depth).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The peer's certificate failed verification.
    #[error("peer authentication failed")]
    PeerAuth,

    /// The TLS layer reported an error other than peer authentication.
    #[error("TLS error: {0}")]
    Crypto(String),

    /// Accept or dial failed because a resource (memory, file
    /// descriptors) was exhausted. Triggers the accept-loop backoff
    /// described in [`crate::endpoint`].
    #[error("out of memory")]
    OutOfMemory,

    /// An I/O error surfaced by the underlying stream that does not map
    /// onto a more specific variant above.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::TimedOut => Error::TimedOut,
            Error::WouldBlock => Error::WouldBlock,
            Error::Closed => Error::Closed,
            Error::ConnectionRefused => Error::ConnectionRefused,
            Error::ConnectionShut => Error::ConnectionShut,
            Error::ProtocolError => Error::ProtocolError,
            Error::MessageTooLarge => Error::MessageTooLarge,
            Error::AddressInvalid(s) => Error::AddressInvalid(s.clone()),
            Error::AddressInUse => Error::AddressInUse,
            Error::BadType => Error::BadType,
            Error::Unsupported => Error::Unsupported,
            Error::NoSuchEntity => Error::NoSuchEntity,
            Error::Busy => Error::Busy,
            Error::StateInvalid => Error::StateInvalid,
            Error::InvalidArgument(s) => Error::InvalidArgument(s.clone()),
            Error::PeerAuth => Error::PeerAuth,
            Error::Crypto(s) => Error::Crypto(s.clone()),
            Error::OutOfMemory => Error::OutOfMemory,
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
