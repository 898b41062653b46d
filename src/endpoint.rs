//! Transport endpoint: per-dialer or per-listener state (spec §3
//! "Endpoint", §4.4). Owns either a stream dialer or a stream listener,
//! drives the accept/connect loop with backoff, and matches negotiated
//! pipes against the socket's posted `connect`/`accept` aio. Grounded
//! against `tlstran_ep_*` in
//! `examples/original_source/src/sp/transport/tls/tls.c`
//! (`tlstran_ep_accept`, `tlstran_ep_connect`, `tlstran_ep_match`,
//! `tlstran_ep_timer_cb`, `tlstran_ep_init_listener`).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;

use crate::aio::{Aio, AioResult};
use crate::error::{Error, Result};
use crate::pipe::Pipe;
use crate::stream::tcp;
use crate::stream::tls::TlsConn;
use crate::stream::Stream;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// A dialer or listener's identity. Dialers and listeners are kept in
/// separate tables by [`crate::socket::Socket`], each keyed by an id drawn
/// from this one shared counter — so a raw id that was actually handed out
/// as a listener id can never coincidentally resolve in the dialer table
/// (spec §4.5 "Endpoint id forgery detection").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    fn next() -> Self {
        Self(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

enum Kind {
    Dialer {
        host: String,
        port: u16,
        server_name: String,
        tls: Arc<rustls::ClientConfig>,
    },
    Listener {
        listener: AsyncMutex<Option<TcpListener>>,
        tls: Arc<rustls::ServerConfig>,
    },
}

struct PipeLists {
    negotiating: Vec<Arc<Pipe>>,
    waiting: VecDeque<Arc<Pipe>>,
    busy: Vec<Arc<Pipe>>,
}

impl PipeLists {
    fn new() -> Self {
        Self {
            negotiating: Vec::new(),
            waiting: VecDeque::new(),
            busy: Vec::new(),
        }
    }

    fn remove(&mut self, id: u64) {
        self.negotiating.retain(|p| p.id() != id);
        self.waiting.retain(|p| p.id() != id);
        self.busy.retain(|p| p.id() != id);
    }
}

/// Per-dialer or per-listener transport state.
pub struct Endpoint {
    id: EndpointId,
    url: String,
    local_proto: u16,
    rcvmax: AtomicU64,
    reconnect_min_ms: AtomicU64,
    reconnect_max_ms: AtomicU64,
    started: AtomicBool,
    closed: AtomicBool,
    kind: Kind,
    /// The address actually bound, for listeners (`None` for dialers) —
    /// needed when the caller asked to bind port `0` and wants to find out
    /// what the OS actually chose.
    local_addr: Option<std::net::SocketAddr>,
    pipes: StdMutex<PipeLists>,
    useraio: AsyncMutex<Option<Aio>>,
    next_pipe_id: AtomicU64,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Builds a dialer endpoint. Does not connect until [`Endpoint::start`].
    pub fn new_dialer(
        url: String,
        host: String,
        port: u16,
        server_name: String,
        local_proto: u16,
        tls: Arc<rustls::ClientConfig>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: EndpointId::next(),
            url,
            local_proto,
            rcvmax: AtomicU64::new(0),
            reconnect_min_ms: AtomicU64::new(100),
            reconnect_max_ms: AtomicU64::new(0),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            kind: Kind::Dialer {
                host,
                port,
                server_name,
                tls,
            },
            local_addr: None,
            pipes: StdMutex::new(PipeLists::new()),
            useraio: AsyncMutex::new(None),
            next_pipe_id: AtomicU64::new(1),
        })
    }

    /// Builds a listener endpoint, resolving and binding the address
    /// synchronously at construction time — the supplemented behavior
    /// from `tlstran_ep_init_listener`, which resolves and waits before
    /// the endpoint is usable rather than lazily on first `start`.
    pub fn new_listener(
        url: String,
        family: crate::addr::AddressFamily,
        host: Option<&str>,
        port: u16,
        local_proto: u16,
        tls: Arc<rustls::ServerConfig>,
    ) -> Result<Arc<Self>> {
        use crate::addr::AddressFamily;
        use std::net::ToSocketAddrs;
        let host = host.unwrap_or(match family {
            AddressFamily::Inet6 => "::",
            _ => "0.0.0.0",
        });
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::AddressInvalid(e.to_string()))?
            .next()
            .ok_or_else(|| Error::AddressInvalid(format!("{host}:{port} resolved to nothing")))?;
        let std_listener = std::net::TcpListener::bind(addr).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                Error::AddressInUse
            } else {
                Error::Io(e)
            }
        })?;
        std_listener
            .set_nonblocking(true)
            .map_err(Error::from)?;
        let bound_addr = std_listener.local_addr().ok();
        let listener = TcpListener::from_std(std_listener).map_err(Error::from)?;
        Ok(Arc::new(Self {
            id: EndpointId::next(),
            url,
            local_proto,
            rcvmax: AtomicU64::new(0),
            reconnect_min_ms: AtomicU64::new(100),
            reconnect_max_ms: AtomicU64::new(0),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            kind: Kind::Listener {
                listener: AsyncMutex::new(Some(listener)),
                tls,
            },
            local_addr: bound_addr,
            pipes: StdMutex::new(PipeLists::new()),
            useraio: AsyncMutex::new(None),
            next_pipe_id: AtomicU64::new(1),
        }))
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn rcvmax(&self) -> u64 {
        self.rcvmax.load(Ordering::Acquire)
    }

    pub fn set_rcvmax(&self, v: u64) {
        self.rcvmax.store(v, Ordering::Release);
    }

    pub fn reconnect_min(&self) -> Duration {
        Duration::from_millis(self.reconnect_min_ms.load(Ordering::Acquire))
    }

    pub fn set_reconnect_min(&self, d: Duration) -> Result<()> {
        if matches!(self.kind, Kind::Listener { .. }) {
            return Err(Error::Unsupported);
        }
        self.reconnect_min_ms.store(d.as_millis() as u64, Ordering::Release);
        Ok(())
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.load(Ordering::Acquire))
    }

    pub fn set_reconnect_max(&self, d: Duration) -> Result<()> {
        if matches!(self.kind, Kind::Listener { .. }) {
            return Err(Error::Unsupported);
        }
        self.reconnect_max_ms.store(d.as_millis() as u64, Ordering::Release);
        Ok(())
    }

    pub fn is_listener(&self) -> bool {
        matches!(self.kind, Kind::Listener { .. })
    }

    /// The address actually bound, for a listener that bound port `0`.
    /// `None` for dialers.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }

    /// Starts the endpoint's background accept or connect loop. A second
    /// call on an already-started endpoint fails with `StateInvalid`
    /// (spec §8 item 6: "restarting an already-started listener returns
    /// state-invalid").
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::StateInvalid);
        }
        match &self.kind {
            Kind::Dialer { .. } => {
                tokio::spawn(self.clone().dial_loop());
            }
            Kind::Listener { .. } => {
                tokio::spawn(self.clone().accept_loop());
            }
        }
        Ok(())
    }

    /// Posts the single user-facing `connect`/`accept` aio. Fails with
    /// `Busy` if one is already outstanding (spec §3 invariant).
    pub async fn post_useraio(self: &Arc<Self>, aio: Aio) -> Result<()> {
        {
            let mut slot = self.useraio.lock().await;
            if slot.is_some() {
                return Err(Error::Busy);
            }
            *slot = Some(aio);
        }
        self.try_match().await;
        Ok(())
    }

    /// Bridges the callback-based `useraio` contract to plain
    /// `async`/`await`: posts a `connect`/`accept` request and waits for
    /// the next matched pipe, the way [`crate::socket::Socket`]'s harvest
    /// loop drains newly negotiated pipes into the protocol op-table.
    pub async fn next_pipe(self: &Arc<Self>) -> Result<Arc<Pipe>> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = std::sync::Mutex::new(Some(tx));
        let aio = Aio::new(move |_, res| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(res);
            }
        });
        aio.begin().await?;
        aio.schedule(|_| {}).await?;
        self.post_useraio(aio.clone()).await?;
        let res = rx.await.map_err(|_| Error::Closed)?;
        match res {
            AioResult::MatchOk => aio
                .take_output::<Arc<Pipe>>()
                .await
                .ok_or(Error::Closed),
            AioResult::MatchErr(e) => Err(e),
            _ => Err(Error::Closed),
        }
    }

    async fn try_match(self: &Arc<Self>) {
        let pipe = {
            let mut lists = self.pipes.lock().unwrap();
            lists.waiting.pop_front()
        };
        let Some(pipe) = pipe else { return };
        let aio = {
            let mut slot = self.useraio.lock().await;
            slot.take()
        };
        let Some(aio) = aio else {
            // No one is waiting after all; put it back.
            self.pipes.lock().unwrap().waiting.push_front(pipe);
            return;
        };
        pipe.set_rcvmax(self.rcvmax());
        {
            let mut lists = self.pipes.lock().unwrap();
            lists.busy.push(pipe.clone());
        }
        aio.set_output(pipe).await;
        aio.finish_sync(AioResult::MatchOk).await;
    }

    /// Called by a pipe once SP negotiation succeeds: moves it from
    /// `negotiating` to `waiting` and retries the match.
    pub fn on_pipe_negotiated(self: &Arc<Self>, pipe: Arc<Pipe>) {
        {
            let mut lists = self.pipes.lock().unwrap();
            lists.negotiating.retain(|p| p.id() != pipe.id());
            lists.waiting.push_back(pipe);
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.try_match().await;
        });
    }

    /// Called by a pipe (or by `close_pipe`) once it is gone, from
    /// whichever list it was in.
    pub fn on_pipe_closed(&self, id: u64) {
        self.pipes.lock().unwrap().remove(id);
    }

    /// Closes a specific busy pipe — the hook the protocol layer calls
    /// once it observes a transport error (spec §9's documented
    /// resolution: pipes don't self-close on queue-head failure).
    pub async fn close_pipe(&self, pipe: Arc<Pipe>) {
        pipe.close().await;
        self.on_pipe_closed(pipe.id());
    }

    async fn dial_loop(self: Arc<Self>) {
        let Kind::Dialer {
            host,
            port,
            server_name,
            tls,
        } = &self.kind
        else {
            return;
        };
        let mut backoff = self.reconnect_min().max(Duration::from_millis(1));
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            match self.try_dial(host, *port, server_name, tls).await {
                Ok(pipe) => {
                    backoff = self.reconnect_min().max(Duration::from_millis(1));
                    {
                        let mut lists = self.pipes.lock().unwrap();
                        lists.negotiating.push(pipe.clone());
                    }
                    self.wait_pipe_gone(&pipe).await;
                }
                Err(e) => {
                    debug!("endpoint {:?} dial failed: {}", self.id, e);
                }
            }
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            tokio::time::sleep(backoff).await;
            let max = self.reconnect_max();
            if !max.is_zero() {
                backoff = (backoff * 2).min(max);
            }
        }
    }

    async fn try_dial(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        server_name: &str,
        tls: &Arc<rustls::ClientConfig>,
    ) -> Result<Arc<Pipe>> {
        let tcp = tcp::dial(host, port).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::ConnectionRefused => Error::ConnectionRefused,
            _ => Error::Io(e),
        })?;
        let conn = TlsConn::connect(tcp, tls.clone(), server_name).await?;
        let id = self.next_pipe_id.fetch_add(1, Ordering::Relaxed);
        Ok(Pipe::start(
            id,
            Arc::new(conn) as Arc<dyn Stream>,
            Arc::downgrade(self),
            self.local_proto,
            self.rcvmax(),
        ))
    }

    async fn wait_pipe_gone(&self, pipe: &Arc<Pipe>) {
        loop {
            if pipe.is_closed().await || self.closed.load(Ordering::Acquire) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    async fn accept_loop(self: Arc<Self>) {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            let accept_result = {
                let Kind::Listener { listener, .. } = &self.kind else {
                    return;
                };
                let guard = listener.lock().await;
                match guard.as_ref() {
                    Some(l) => l.accept().await,
                    None => return,
                }
            };
            match accept_result {
                Ok((tcp, _addr)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.finish_accept(tcp).await;
                    });
                }
                Err(e) => {
                    if self.closed.load(Ordering::Acquire) {
                        return;
                    }
                    if is_resource_exhausted(&e) {
                        warn!("endpoint {:?} accept backing off: {}", self.id, e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    } else {
                        debug!("endpoint {:?} accept error: {}", self.id, e);
                    }
                }
            }
        }
    }

    async fn finish_accept(self: Arc<Self>, tcp: TcpStream) {
        let Kind::Listener { tls, .. } = &self.kind else {
            return;
        };
        match TlsConn::accept(tcp, tls.clone()).await {
            Ok(conn) => {
                let id = self.next_pipe_id.fetch_add(1, Ordering::Relaxed);
                let pipe = Pipe::start(
                    id,
                    Arc::new(conn) as Arc<dyn Stream>,
                    Arc::downgrade(&self),
                    self.local_proto,
                    self.rcvmax(),
                );
                self.pipes.lock().unwrap().negotiating.push(pipe);
            }
            Err(e) => {
                debug!("endpoint {:?} TLS accept failed: {}", self.id, e);
            }
        }
    }

    /// Closes the endpoint: stops the accept/connect loop, drops every
    /// pipe it owns, and fails the pending `useraio` with `Closed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Kind::Listener { listener, .. } = &self.kind {
            listener.lock().await.take();
        }
        let pipes: Vec<Arc<Pipe>> = {
            let mut lists = self.pipes.lock().unwrap();
            let mut pipes: Vec<Arc<Pipe>> = lists.negotiating.drain(..).collect();
            pipes.extend(lists.waiting.drain(..));
            pipes.extend(lists.busy.drain(..));
            pipes
        };
        for pipe in pipes {
            pipe.close().await;
        }
        if let Some(aio) = self.useraio.lock().await.take() {
            aio.finish_sync(AioResult::MatchErr(Error::Closed)).await;
        }
    }
}

fn is_resource_exhausted(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(errno) if errno == 24 /* EMFILE */ || errno == 23 /* ENFILE */
    ) || e.kind() == std::io::ErrorKind::Other
}
