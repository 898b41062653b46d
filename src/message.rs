//! Wire messages.
//!
//! A [`Message`] is the unit user data moves through the system in. It
//! carries an optional protocol-supplied header (consulted only by the
//! `ProtocolOpTable`, never by the framing layer beyond measuring its
//! length) and an opaque body. Ownership follows spec §3: on send-success
//! the transport drops the message; on recv-success the caller takes it.

use bytes::{Bytes, BytesMut};

/// A single SP message: an optional protocol header plus an opaque body.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    header: Bytes,
    body: Bytes,
}

impl Message {
    /// Builds a message with no header from a body.
    pub fn from_body(body: impl Into<Bytes>) -> Self {
        Self {
            header: Bytes::new(),
            body: body.into(),
        }
    }

    /// Builds a message from separate header and body buffers.
    pub fn with_header(header: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            header: header.into(),
            body: body.into(),
        }
    }

    /// The protocol header, if any.
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// The message body.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// `header.len() + body.len()`, the value written as the wire length
    /// prefix (spec §4.3).
    pub fn wire_len(&self) -> u64 {
        (self.header.len() + self.body.len()) as u64
    }

    /// Reassembles a message from a freshly-received, unframed buffer
    /// (the framing layer never splits header from body on the wire — see
    /// `pipe.rs` — so a received message always has an empty header; a
    /// protocol op-table may reinterpret the leading bytes of `body` as
    /// its own header via [`Message::split_header`]).
    pub fn from_wire(buf: BytesMut) -> Self {
        Self {
            header: Bytes::new(),
            body: buf.freeze(),
        }
    }

    /// Splits the first `n` bytes of the body off as the header,
    /// consumed by protocol op-tables that impose their own header
    /// layout on top of the raw frame.
    pub fn split_header(&mut self, n: usize) {
        let mut body = std::mem::take(&mut self.body);
        self.header = body.split_to(n.min(body.len()));
        self.body = body;
    }
}
