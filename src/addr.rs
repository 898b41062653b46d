//! Addresses used by the TLS-over-TCP transport.

use std::net::SocketAddr as StdSocketAddr;

/// The address family a listener binds to, selected by the URL scheme
/// (spec §4.5: `tls+tcp` → unspecified, `tls+tcp4` → IPv4, `tls+tcp6` →
/// IPv6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressFamily {
    /// No family preference; resolves to whatever the resolver returns
    /// first.
    Unspecified,
    /// IPv4 only.
    Inet,
    /// IPv6 only.
    Inet6,
}

/// The resolved address of a pipe's peer, as reported by its stream
/// provider.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketAddr {
    /// A TCP/TLS peer address.
    Inet(StdSocketAddr),
    /// The address could not be determined (e.g. the stream has closed).
    Unspecified,
}

impl From<StdSocketAddr> for SocketAddr {
    fn from(addr: StdSocketAddr) -> Self {
        SocketAddr::Inet(addr)
    }
}
