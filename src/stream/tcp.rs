//! The raw TCP half of the transport, used only to accept/dial a socket
//! before TLS is layered on top of it (spec §4.2 treats the TLS crypto
//! state machine as an opaque collaborator — this module supplies the
//! plaintext plumbing underneath it).

use std::io;

use tokio::net::TcpStream;

/// Dials a plain TCP connection to `host:port`.
pub async fn dial(host: &str, port: u16) -> io::Result<TcpStream> {
    TcpStream::connect((host, port)).await
}
