//! The transport pipe: one TLS-over-TCP stream that has (or is trying to)
//! negotiate SP compatibility with its peer.
//!
//! Lifecycle (spec §3, §4.3): a pipe is allocated around an already-
//! connected [`Stream`] and [`Pipe::start`]ed. It negotiates, moves from
//! the endpoint's `negotiating` list to `waiting`, sits there until the
//! endpoint matches it against a `useraio`, then carries `busy` send/recv
//! traffic until something closes it. Grounded line-for-line against
//! `tlstran_pipe_nego_cb`, `tlstran_pipe_send_cb`, `tlstran_pipe_recv_cb`,
//! `tlstran_pipe_send_start`, `tlstran_pipe_recv_start` in
//! `examples/original_source/src/sp/transport/tls/tls.c`.

use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use bytes::BytesMut;
use log::{debug, warn};
use tokio::sync::{Mutex as AsyncMutex, Notify};

use crate::addr::SocketAddr;
use crate::aio::{Aio, AioResult};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::reap::ReapGuard;
use crate::stream::Stream;

/// Budget for the whole negotiation exchange (send 8 bytes, recv 8 bytes) —
/// spec §4.3: "posts the negotiation aio with a 10-second timeout... the
/// same aio is then reused to receive."
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(10);

const NEGO_LEN: usize = 8;

/// Where a pipe sits in its endpoint's bookkeeping (spec §3 Endpoint: three
/// pipe lists).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Negotiating,
    Waiting,
    Busy,
    Closed,
}

struct PendingSend {
    msg: Message,
    aio: Aio,
}

struct Shared {
    state: PipeState,
    send_q: VecDeque<PendingSend>,
    recv_q: VecDeque<Aio>,
    send_running: bool,
    recv_running: bool,
    closed: bool,
}

/// One negotiated (or negotiating) connection.
pub struct Pipe {
    id: u64,
    stream: Arc<dyn Stream>,
    endpoint: Weak<Endpoint>,
    local_proto: u16,
    peer_proto: AtomicU16,
    rcvmax: AtomicU64,
    shared: AsyncMutex<Shared>,
    reaped: ReapGuard,
    /// Woken on close so in-flight negotiation/send/recv loops notice
    /// promptly rather than only after their current I/O call returns.
    cancel: Notify,
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Pipe {
    /// Allocates and starts a pipe around a freshly accepted/dialed
    /// stream. Spawns the negotiation and returns immediately; the pipe
    /// is not usable until negotiation succeeds and the endpoint is
    /// notified.
    pub fn start(
        id: u64,
        stream: Arc<dyn Stream>,
        endpoint: Weak<Endpoint>,
        local_proto: u16,
        rcvmax: u64,
    ) -> Arc<Self> {
        let pipe = Arc::new(Self {
            id,
            stream,
            endpoint,
            local_proto,
            peer_proto: AtomicU16::new(0),
            rcvmax: AtomicU64::new(rcvmax),
            shared: AsyncMutex::new(Shared {
                state: PipeState::Negotiating,
                send_q: VecDeque::new(),
                recv_q: VecDeque::new(),
                send_running: false,
                recv_running: false,
                closed: false,
            }),
            reaped: ReapGuard::default(),
            cancel: Notify::new(),
        });
        tokio::spawn(pipe.clone().negotiate());
        pipe
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_protocol(&self) -> u16 {
        self.peer_proto.load(Ordering::Acquire)
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.stream.remote_addr()
    }

    /// `true` if the underlying stream authenticated its peer (spec §8 S5:
    /// "a pipe whose verified-flag is true").
    pub fn verified(&self) -> bool {
        self.stream.verified()
    }

    pub async fn is_closed(&self) -> bool {
        self.shared.lock().await.closed
    }

    pub async fn state(&self) -> PipeState {
        self.shared.lock().await.state
    }

    /// Sets the rcvmax ceiling this pipe enforces on incoming frames,
    /// transferred from the endpoint at match time (spec §4.4 "Matching").
    pub fn set_rcvmax(&self, rcvmax: u64) {
        self.rcvmax.store(rcvmax, Ordering::Release);
    }

    async fn negotiate(self: Arc<Self>) {
        let result = tokio::time::timeout(NEGOTIATION_TIMEOUT, self.run_negotiation()).await;
        let outcome = match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(Error::TimedOut),
        };
        match outcome {
            None => {
                let mut s = self.shared.lock().await;
                if s.closed {
                    return;
                }
                s.state = PipeState::Waiting;
                drop(s);
                if let Some(ep) = self.endpoint.upgrade() {
                    ep.on_pipe_negotiated(self.clone());
                } else {
                    self.close().await;
                }
            }
            Some(err) => {
                debug!("pipe {} negotiation failed: {}", self.id, err);
                self.close().await;
                if let Some(ep) = self.endpoint.upgrade() {
                    ep.on_pipe_closed(self.id);
                }
            }
        }
    }

    async fn run_negotiation(&self) -> Result<()> {
        let mut out = [0u8; NEGO_LEN];
        out[0] = 0x00;
        out[1] = b'S';
        out[2] = b'P';
        out[3] = 0x00;
        BigEndian::write_u16(&mut out[4..6], self.local_proto);
        out[6] = 0x00;
        out[7] = 0x00;
        self.write_all(&out).await.map_err(shut_on_close)?;

        let mut inbuf = [0u8; NEGO_LEN];
        self.read_exact(&mut inbuf).await.map_err(shut_on_close)?;

        if inbuf[0] != 0x00
            || inbuf[1] != b'S'
            || inbuf[2] != b'P'
            || inbuf[3] != 0x00
            || inbuf[6] != 0x00
            || inbuf[7] != 0x00
        {
            return Err(Error::ProtocolError);
        }
        let peer = BigEndian::read_u16(&inbuf[4..6]);
        self.peer_proto.store(peer, Ordering::Release);
        Ok(())
    }

    async fn write_all(&self, mut buf: &[u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            let iov = [IoSlice::new(buf)];
            let n = self.stream.send(&iov).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stream closed mid-write",
                ));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    async fn read_exact(&self, mut buf: &mut [u8]) -> std::io::Result<()> {
        while !buf.is_empty() {
            let mut iov = [IoSliceMut::new(buf)];
            let n = self.stream.recv(&mut iov).await?;
            let (_, rest) = buf.split_at_mut(n);
            buf = rest;
        }
        Ok(())
    }

    /// Submits a message for transmission. Completes `aio` with `SendOk`
    /// once the frame has been written in full, or `SendErr` on failure.
    pub async fn send(self: &Arc<Self>, aio: Aio, msg: Message) {
        let mut s = self.shared.lock().await;
        if s.closed {
            drop(s);
            aio.finish_sync(AioResult::SendErr(Error::Closed)).await;
            return;
        }
        s.send_q.push_back(PendingSend { msg, aio });
        if !s.send_running {
            s.send_running = true;
            drop(s);
            tokio::spawn(self.clone().send_pump());
        }
    }

    async fn send_pump(self: Arc<Self>) {
        loop {
            let next = {
                let s = self.shared.lock().await;
                s.send_q.front().map(|p| p.msg.clone())
            };
            let Some(msg) = next else {
                let mut s = self.shared.lock().await;
                s.send_running = false;
                return;
            };
            let result = self.write_frame(&msg).await;
            let mut s = self.shared.lock().await;
            let Some(head) = s.send_q.pop_front() else {
                continue;
            };
            match result {
                Ok(()) => head.aio.finish_sync(AioResult::SendOk).await,
                Err(e) => {
                    warn!("pipe {} send failed: {}", self.id, e);
                    head.aio.finish_sync(AioResult::SendErr(e.clone())).await;
                    s.send_q.clear();
                    s.send_running = false;
                    drop(s);
                    self.on_transport_error(e).await;
                    return;
                }
            }
        }
    }

    async fn write_frame(&self, msg: &Message) -> Result<()> {
        let mut len_buf = [0u8; 8];
        BigEndian::write_u64(&mut len_buf, msg.wire_len());
        self.write_all(&len_buf).await?;
        if !msg.header().is_empty() {
            self.write_all(msg.header()).await?;
        }
        if !msg.body().is_empty() {
            self.write_all(msg.body()).await?;
        }
        Ok(())
    }

    /// Submits a receive request. Completes `aio` with `RecvOk` (the
    /// received [`Message`] retrievable via `aio.take_output`) or
    /// `RecvErr`.
    pub async fn recv(self: &Arc<Self>, aio: Aio) {
        let mut s = self.shared.lock().await;
        if s.closed {
            drop(s);
            aio.finish_sync(AioResult::RecvErr(Error::Closed)).await;
            return;
        }
        s.recv_q.push_back(aio);
        if !s.recv_running {
            s.recv_running = true;
            drop(s);
            tokio::spawn(self.clone().recv_pump());
        }
    }

    async fn recv_pump(self: Arc<Self>) {
        loop {
            let has_waiter = {
                let s = self.shared.lock().await;
                !s.recv_q.is_empty()
            };
            if !has_waiter {
                let mut s = self.shared.lock().await;
                s.recv_running = false;
                return;
            }
            let result = self.read_frame().await;
            let mut s = self.shared.lock().await;
            let Some(head) = s.recv_q.pop_front() else {
                continue;
            };
            match result {
                Ok(msg) => {
                    let n = msg.wire_len() as usize;
                    drop(s);
                    head.set_output(msg).await;
                    head.finish_sync(AioResult::RecvOk(n)).await;
                }
                Err(e) => {
                    warn!("pipe {} recv failed: {}", self.id, e);
                    head.finish_sync(AioResult::RecvErr(e.clone())).await;
                    s.recv_q.clear();
                    s.recv_running = false;
                    drop(s);
                    // An oversized frame is a protocol violation, not a
                    // transient transport error: the pipe shuts itself down
                    // rather than leaving it to the protocol layer (spec
                    // §4.3 "the oversized frame is rejected ... and the
                    // pipe shuts down").
                    if matches!(e, Error::MessageTooLarge) {
                        self.close().await;
                        if let Some(ep) = self.endpoint.upgrade() {
                            ep.on_pipe_closed(self.id);
                        }
                    } else {
                        self.on_transport_error(e).await;
                    }
                    return;
                }
            }
        }
    }

    async fn read_frame(&self) -> Result<Message> {
        let mut len_buf = [0u8; 8];
        self.read_exact(&mut len_buf).await?;
        let len = BigEndian::read_u64(&len_buf);
        let rcvmax = self.rcvmax.load(Ordering::Acquire);
        if rcvmax > 0 && len > rcvmax {
            return Err(Error::MessageTooLarge);
        }
        let mut body = BytesMut::zeroed(len as usize);
        self.read_exact(&mut body).await?;
        Ok(Message::from_wire(body))
    }

    /// Removes `target` from the send queue if it is still waiting
    /// (i.e. not already the in-flight head) and completes it with `rv`.
    /// The caller registers this as the aio's cancel callback before
    /// handing it to [`Pipe::send`].
    pub async fn cancel_send(&self, target: &Aio, rv: Error) {
        let removed = {
            let mut s = self.shared.lock().await;
            s.send_q
                .iter()
                .position(|p| p.aio.ptr_eq(target))
                .map(|pos| s.send_q.remove(pos).unwrap())
        };
        if let Some(p) = removed {
            p.aio.finish_sync(AioResult::SendErr(rv)).await;
        }
    }

    /// As [`Pipe::cancel_send`], for the recv queue.
    pub async fn cancel_recv(&self, target: &Aio, rv: Error) {
        let removed = {
            let mut s = self.shared.lock().await;
            s.recv_q
                .iter()
                .position(|a| a.ptr_eq(target))
                .map(|pos| s.recv_q.remove(pos).unwrap())
        };
        if let Some(aio) = removed {
            aio.finish_sync(AioResult::RecvErr(rv)).await;
        }
    }

    /// A send or recv queue head failed: per spec §9's documented Open
    /// Question resolution, the pipe does not close itself here — it
    /// relies on the protocol layer above to observe the error on its
    /// next interaction and call `Endpoint::close_pipe`.
    async fn on_transport_error(&self, _err: Error) {}

    /// Sends one message and waits for the result, honoring `timeout` and
    /// propagating cancellation into the send queue if the caller's own
    /// future is dropped before completion. The bridge between the
    /// callback-based [`Aio`] contract and plain `async`/`await`, used by
    /// [`crate::protocol::ProtocolOpTable`] implementations.
    pub async fn send_msg(self: &Arc<Self>, msg: Message, timeout: Option<Duration>) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let aio = Aio::new(move |_, res| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(res);
            }
        });
        aio.begin().await?;
        aio.set_timeout(timeout).await?;
        let pipe = self.clone();
        let cancel_aio = aio.clone();
        aio.schedule(move |rv| {
            tokio::spawn(async move {
                pipe.cancel_send(&cancel_aio, rv).await;
            });
        })
        .await?;
        self.send(aio, msg).await;
        match rx.await {
            Ok(res) => res.into_result(),
            Err(_) => Err(Error::Closed),
        }
    }

    /// As [`Pipe::send_msg`], for receiving.
    pub async fn recv_msg(self: &Arc<Self>, timeout: Option<Duration>) -> Result<Message> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let aio = Aio::new(move |_, res| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(res);
            }
        });
        aio.begin().await?;
        aio.set_timeout(timeout).await?;
        let pipe = self.clone();
        let cancel_aio = aio.clone();
        aio.schedule(move |rv| {
            tokio::spawn(async move {
                pipe.cancel_recv(&cancel_aio, rv).await;
            });
        })
        .await?;
        self.recv(aio.clone()).await;
        let res = rx.await.map_err(|_| Error::Closed)?;
        match res {
            AioResult::RecvOk(_) => aio
                .take_output::<Message>()
                .await
                .ok_or(Error::Closed),
            AioResult::RecvErr(e) => Err(e),
            _ => Err(Error::Closed),
        }
    }

    /// Idempotently tears the pipe down: marks it closed, fails every
    /// queued aio with `Closed`, and hands the stream to the reap list.
    pub async fn close(self: &Arc<Self>) {
        if !self.reaped.mark() {
            return;
        }
        let (sendq, recvq) = {
            let mut s = self.shared.lock().await;
            s.closed = true;
            s.state = PipeState::Closed;
            (
                std::mem::take(&mut s.send_q),
                std::mem::take(&mut s.recv_q),
            )
        };
        self.cancel.notify_waiters();
        self.stream.close();
        for p in sendq {
            p.aio.finish_sync(AioResult::SendErr(Error::Closed)).await;
        }
        for aio in recvq {
            aio.finish_sync(AioResult::RecvErr(Error::Closed)).await;
        }
    }
}

fn shut_on_close(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof || e.kind() == std::io::ErrorKind::NotConnected
    {
        Error::ConnectionShut
    } else {
        Error::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool as StdAtomicBool;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    /// An in-memory `Stream` over a `tokio::io::duplex` pair, standing in
    /// for TLS in tests that only exercise framing/negotiation and have no
    /// need for a real handshake.
    struct TestStream {
        reader: AsyncMutex<ReadHalf<DuplexStream>>,
        writer: AsyncMutex<WriteHalf<DuplexStream>>,
        closed: StdAtomicBool,
    }

    impl TestStream {
        fn pair() -> (Arc<Self>, Arc<Self>) {
            let (a, b) = tokio::io::duplex(4096);
            (Arc::new(Self::new(a)), Arc::new(Self::new(b)))
        }

        fn new(stream: DuplexStream) -> Self {
            let (r, w) = tokio::io::split(stream);
            Self {
                reader: AsyncMutex::new(r),
                writer: AsyncMutex::new(w),
                closed: StdAtomicBool::new(false),
            }
        }
    }

    #[async_trait::async_trait]
    impl Stream for TestStream {
        async fn send(&self, bufs: &[IoSlice<'_>]) -> std::io::Result<usize> {
            if self.closed.load(Ordering::Acquire) {
                return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "closed"));
            }
            self.writer.lock().await.write_vectored(bufs).await
        }

        async fn recv(&self, bufs: &mut [IoSliceMut<'_>]) -> std::io::Result<usize> {
            if self.closed.load(Ordering::Acquire) {
                return Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "closed"));
            }
            // Tokio's `AsyncRead` has no vectored read; every caller hands
            // this exactly one buffer.
            let buf = bufs.first_mut().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "recv called with no buffers")
            })?;
            let n = self.reader.lock().await.read(buf).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed",
                ));
            }
            Ok(n)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Release);
        }

        fn remote_addr(&self) -> SocketAddr {
            SocketAddr::Unspecified
        }
    }

    /// A backing endpoint for a test pipe: never started (no dial/accept
    /// loop spawned), but alive so `Pipe::negotiate` has somewhere to
    /// report completion to instead of self-closing for want of an owner.
    fn dummy_endpoint() -> Arc<Endpoint> {
        let tls = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        Endpoint::new_dialer(
            "tls+tcp://127.0.0.1:0".to_string(),
            "127.0.0.1".to_string(),
            0,
            "localhost".to_string(),
            1,
            Arc::new(tls),
        )
    }

    fn start_pair(rcvmax: u64) -> (Arc<Endpoint>, Arc<Pipe>, Arc<Endpoint>, Arc<Pipe>) {
        let ep_a = dummy_endpoint();
        let ep_b = dummy_endpoint();
        let (a, b) = TestStream::pair();
        let pipe_a = Pipe::start(1, a, Arc::downgrade(&ep_a), 1, rcvmax);
        let pipe_b = Pipe::start(2, b, Arc::downgrade(&ep_b), 1, rcvmax);
        (ep_a, pipe_a, ep_b, pipe_b)
    }

    async fn until_negotiated(pipe: &Arc<Pipe>) {
        for _ in 0..200 {
            if pipe.state().await != PipeState::Negotiating {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pipe never left Negotiating");
    }

    #[tokio::test]
    async fn round_trip_delivers_exact_bytes() {
        let (_ep_a, a, _ep_b, b) = start_pair(0);
        until_negotiated(&a).await;
        until_negotiated(&b).await;
        assert_eq!(a.state().await, PipeState::Waiting);

        a.send_msg(Message::from_body(&b"abc\0"[..]), None).await.unwrap();
        let got = b.recv_msg(None).await.unwrap();
        assert_eq!(got.body(), b"abc\0");
    }

    #[tokio::test]
    async fn zero_length_message_round_trips() {
        let (_ep_a, a, _ep_b, b) = start_pair(0);
        until_negotiated(&a).await;
        until_negotiated(&b).await;

        a.send_msg(Message::from_body(&b""[..]), None).await.unwrap();
        let got = b.recv_msg(None).await.unwrap();
        assert_eq!(got.body(), b"");
    }

    #[tokio::test]
    async fn oversize_frame_is_message_too_large_and_closes_pipe() {
        let (_ep_a, a, _ep_b, b) = start_pair(4);
        until_negotiated(&a).await;
        until_negotiated(&b).await;

        a.send_msg(Message::from_body(&b"toolong"[..]), None).await.unwrap();
        let err = b.recv_msg(None).await.unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge));

        for _ in 0..100 {
            if b.is_closed().await {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("pipe did not close after oversize frame");
    }

    #[tokio::test]
    async fn wrong_magic_is_protocol_error() {
        let (a, b) = TestStream::pair();
        // `a` plays a peer that sends a correctly-length-but-wrong-magic
        // header by hand, instead of going through `Pipe::start`'s real
        // negotiation.
        let bad = [0x7Fu8, b'S', b'P', 0x00, 0x00, 0x01, 0x00, 0x00];
        let write_task = tokio::spawn(async move {
            let iov = [IoSlice::new(&bad)];
            let _ = a.send(&iov).await;
        });
        let pipe_b = Pipe::start(1, b, Weak::new(), 1, 0);
        write_task.await.unwrap();

        for _ in 0..200 {
            if pipe_b.state().await == PipeState::Closed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pipe with bad magic never closed");
    }

    #[tokio::test]
    async fn recv_timeout_fires_with_no_message_sent() {
        let (_ep_a, a, _ep_b, b) = start_pair(0);
        until_negotiated(&a).await;
        until_negotiated(&b).await;
        let before = std::time::Instant::now();
        let err = a
            .recv_msg(Some(Duration::from_millis(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TimedOut));
        assert!(before.elapsed() < Duration::from_millis(500));
    }
}
