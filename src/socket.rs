//! The synchronous socket API surface (spec §3 "Socket", §4.6, §4.8).
//!
//! A [`Socket`] owns a set of dialer/listener endpoints (kept in separate
//! tables so a raw id, even if numerically reused, can never resolve
//! against the wrong kind — spec §4.5 "Endpoint id forgery detection") and
//! delegates `send`/`recv` to a [`ProtocolOpTable`]. Every operation here
//! is `async fn`, but each one posts and awaits exactly one logical aio
//! internally, mirroring the blocking `nng_send`/`nng_recv` surface this
//! crate's async runtime stands in for (spec §4.8).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use log::debug;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::endpoint::{Endpoint, EndpointId};
use crate::error::{Error, Result};
use crate::message::Message;
use crate::options::{self, OptionValue};
use crate::protocol::ProtocolOpTable;
use crate::url;

struct Timeouts {
    send: Option<Duration>,
    recv: Option<Duration>,
}

/// The user-facing socket: send/recv, endpoint management, and the
/// option table.
pub struct Socket {
    proto: Arc<dyn ProtocolOpTable>,
    dialers: StdMutex<HashMap<EndpointId, Arc<Endpoint>>>,
    listeners: StdMutex<HashMap<EndpointId, Arc<Endpoint>>>,
    timeouts: StdMutex<Timeouts>,
    nonblocking: AtomicBool,
    recv_max: StdMutex<u64>,
    reconnect_min: StdMutex<Duration>,
    reconnect_max: StdMutex<Duration>,
    recv_buf: StdMutex<i32>,
    send_buf: StdMutex<i32>,
    // Message-count-bounded socket buffers (spec §3 "Socket ... maintains
    // bounded send/recv buffers", spec §8 "Buffer semantics"): each
    // occupied slot is one message currently queued between the caller
    // and the wire. A `Semaphore` permit stands in for one free slot;
    // acquiring one is the "space in the buffer" check, and the permit is
    // held for the lifetime of that message's transfer.
    send_buf_sem: StdMutex<Arc<Semaphore>>,
    recv_buf_sem: StdMutex<Arc<Semaphore>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").finish_non_exhaustive()
    }
}

impl Socket {
    /// Opens a socket over the given protocol op-table (spec §1: only
    /// [`crate::protocol::RawPairProtocol`] is supplied).
    pub fn new(proto: Arc<dyn ProtocolOpTable>) -> Arc<Self> {
        Arc::new(Self {
            proto,
            dialers: StdMutex::new(HashMap::new()),
            listeners: StdMutex::new(HashMap::new()),
            timeouts: StdMutex::new(Timeouts {
                send: None,
                recv: None,
            }),
            nonblocking: AtomicBool::new(false),
            recv_max: StdMutex::new(0),
            reconnect_min: StdMutex::new(Duration::from_millis(100)),
            reconnect_max: StdMutex::new(Duration::ZERO),
            recv_buf: StdMutex::new(1),
            send_buf: StdMutex::new(1),
            send_buf_sem: StdMutex::new(Arc::new(Semaphore::new(1))),
            recv_buf_sem: StdMutex::new(Arc::new(Semaphore::new(1))),
            closed: AtomicBool::new(false),
        })
    }

    /// Creates (and binds) a dialer endpoint for `url`, but does not yet
    /// start dialing — call [`Socket::start`] to do that (spec §8 item 6).
    pub fn dial(self: &Arc<Self>, raw_url: &str, tls: Arc<rustls::ClientConfig>) -> Result<EndpointId> {
        let parsed = url::parse_dialer(raw_url)?;
        let server_name = parsed.host.clone();
        let ep = Endpoint::new_dialer(
            raw_url.to_string(),
            parsed.host,
            parsed.port,
            server_name,
            self.proto.id(),
            tls,
        );
        ep.set_rcvmax(*self.recv_max.lock().unwrap());
        let _ = ep.set_reconnect_min(*self.reconnect_min.lock().unwrap());
        let _ = ep.set_reconnect_max(*self.reconnect_max.lock().unwrap());
        let id = ep.id();
        self.dialers.lock().unwrap().insert(id, ep);
        Ok(id)
    }

    /// Creates and binds a listener endpoint for `url`. Binding happens
    /// synchronously here (spec §4.5); a second listener on the same
    /// address fails with `Error::AddressInUse`.
    pub fn listen(self: &Arc<Self>, raw_url: &str, tls: Arc<rustls::ServerConfig>) -> Result<EndpointId> {
        let parsed = url::parse_listener(raw_url)?;
        let host = if parsed.host.is_empty() {
            None
        } else {
            Some(parsed.host.as_str())
        };
        let ep = Endpoint::new_listener(
            raw_url.to_string(),
            parsed.family,
            host,
            parsed.port,
            self.proto.id(),
            tls,
        )?;
        ep.set_rcvmax(*self.recv_max.lock().unwrap());
        let id = ep.id();
        self.listeners.lock().unwrap().insert(id, ep);
        Ok(id)
    }

    /// The address a listener actually bound, useful after binding port
    /// `0` to find out which port the OS chose. `None` for a dialer id or
    /// an id that doesn't resolve to a listener.
    pub fn listener_local_addr(&self, id: EndpointId) -> Option<std::net::SocketAddr> {
        self.listeners.lock().unwrap().get(&id)?.local_addr()
    }

    /// Starts a previously created dialer's connect loop and its pipe
    /// harvest task.
    pub fn start_dialer(self: &Arc<Self>, id: EndpointId) -> Result<()> {
        let ep = self
            .dialers
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::NoSuchEntity)?;
        ep.start()?;
        self.spawn_harvest(ep);
        Ok(())
    }

    /// Starts a previously created listener's accept loop and its pipe
    /// harvest task.
    pub fn start_listener(self: &Arc<Self>, id: EndpointId) -> Result<()> {
        let ep = self
            .listeners
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::NoSuchEntity)?;
        ep.start()?;
        self.spawn_harvest(ep);
        Ok(())
    }

    fn spawn_harvest(self: &Arc<Self>, ep: Arc<Endpoint>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if this.closed.load(Ordering::Acquire) {
                    return;
                }
                match ep.next_pipe().await {
                    Ok(pipe) => {
                        this.proto.add_pipe(pipe.clone()).await;
                        let proto = this.proto.clone();
                        let ep2 = ep.clone();
                        tokio::spawn(async move {
                            while !pipe.is_closed().await {
                                tokio::time::sleep(Duration::from_millis(100)).await;
                            }
                            proto.remove_pipe(pipe.id()).await;
                            ep2.on_pipe_closed(pipe.id());
                        });
                    }
                    Err(Error::Closed) => return,
                    Err(e) => {
                        debug!("pipe harvest error: {}", e);
                        return;
                    }
                }
            }
        });
    }

    /// Closes a dialer handle. `Error::NoSuchEntity` if `id` does not
    /// resolve in the dialer table — including when `id` is actually a
    /// listener's id (spec §4.5 forgery detection, §8 item 5).
    pub async fn close_dialer(&self, id: EndpointId) -> Result<()> {
        let ep = self.dialers.lock().unwrap().remove(&id).ok_or(Error::NoSuchEntity)?;
        ep.close().await;
        Ok(())
    }

    /// As [`Socket::close_dialer`], for listeners.
    pub async fn close_listener(&self, id: EndpointId) -> Result<()> {
        let ep = self
            .listeners
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(Error::NoSuchEntity)?;
        ep.close().await;
        Ok(())
    }

    /// Sends one message, honoring the configured send timeout and the
    /// non-blocking flag (spec §4.8). Blocks for a free send-buffer slot
    /// first (spec §8 "Buffer semantics" — if the buffer has space and a
    /// pipe is ready the transfer is immediate; otherwise this call waits
    /// for either to free up, bounded by the same timeout).
    pub async fn send(&self, msg: Message) -> Result<()> {
        let nonblocking = self.nonblocking.load(Ordering::Acquire);
        let timeout = self.effective_timeout(nonblocking, self.timeouts.lock().unwrap().send);
        let sem = self.send_buf_sem.lock().unwrap().clone();
        let start = Instant::now();
        let _permit = acquire_buffer_slot(sem, timeout, nonblocking).await?;
        let remaining = remaining_timeout(timeout, start);
        self.proto.send(msg, remaining).await.map_err(|e| as_would_block(e, nonblocking))
    }

    /// Receives one message (spec §4.8). On timeout, returns
    /// `Err(Error::TimedOut)` with no message ever constructed — the
    /// idiomatic expression of the original's "null message pointer".
    /// Blocks for a free recv-buffer slot first, same as [`Socket::send`].
    pub async fn recv(&self) -> Result<Message> {
        let nonblocking = self.nonblocking.load(Ordering::Acquire);
        let timeout = self.effective_timeout(nonblocking, self.timeouts.lock().unwrap().recv);
        let sem = self.recv_buf_sem.lock().unwrap().clone();
        let start = Instant::now();
        let _permit = acquire_buffer_slot(sem, timeout, nonblocking).await?;
        let remaining = remaining_timeout(timeout, start);
        self.proto.recv(remaining).await.map_err(|e| as_would_block(e, nonblocking))
    }

    fn effective_timeout(&self, nonblocking: bool, configured: Option<Duration>) -> Option<Duration> {
        if nonblocking {
            Some(Duration::ZERO)
        } else {
            configured
        }
    }

    /// Closes the socket: every dialer and listener, and whatever pipes
    /// they own.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let dialers: Vec<_> = self.dialers.lock().unwrap().drain().map(|(_, e)| e).collect();
        let listeners: Vec<_> = self.listeners.lock().unwrap().drain().map(|(_, e)| e).collect();
        for ep in dialers.into_iter().chain(listeners) {
            ep.close().await;
        }
    }

    /// Gets a socket-level option by name (spec §4.5/§4.7).
    pub fn get_option(&self, name: &str) -> Result<OptionValue> {
        match name {
            options::RECV_TIMEOUT => Ok(OptionValue::Duration(
                self.timeouts.lock().unwrap().recv.unwrap_or(Duration::ZERO),
            )),
            options::SEND_TIMEOUT => Ok(OptionValue::Duration(
                self.timeouts.lock().unwrap().send.unwrap_or(Duration::ZERO),
            )),
            options::RECV_MAX => Ok(OptionValue::U64(*self.recv_max.lock().unwrap())),
            options::RECONNECT_MIN => Ok(OptionValue::Duration(*self.reconnect_min.lock().unwrap())),
            options::RECONNECT_MAX => Ok(OptionValue::Duration(*self.reconnect_max.lock().unwrap())),
            options::RECV_BUF => Ok(OptionValue::I32(*self.recv_buf.lock().unwrap())),
            options::SEND_BUF => Ok(OptionValue::I32(*self.send_buf.lock().unwrap())),
            _ => Err(Error::Unsupported),
        }
    }

    /// Sets a socket-level option by name. Wrong value type → `BadType`;
    /// unknown name → `Unsupported`; out-of-range value → `InvalidArgument`
    /// (spec §4.5, §8 item 4).
    pub fn set_option(&self, name: &str, value: OptionValue) -> Result<()> {
        match name {
            options::RECV_TIMEOUT => {
                self.timeouts.lock().unwrap().recv = Some(value.as_duration()?);
            }
            options::SEND_TIMEOUT => {
                self.timeouts.lock().unwrap().send = Some(value.as_duration()?);
            }
            options::RECV_MAX => {
                let v = options::checked_recv_max(value.as_u64()?)?;
                *self.recv_max.lock().unwrap() = v;
            }
            options::RECONNECT_MIN => {
                *self.reconnect_min.lock().unwrap() = value.as_duration()?;
            }
            options::RECONNECT_MAX => {
                *self.reconnect_max.lock().unwrap() = value.as_duration()?;
            }
            options::RECV_BUF => {
                let v = value.as_i32()?;
                if v < 0 {
                    return Err(Error::InvalidArgument(format!("recv-buf {v} is negative")));
                }
                *self.recv_buf.lock().unwrap() = v;
                *self.recv_buf_sem.lock().unwrap() = Arc::new(Semaphore::new(v as usize));
            }
            options::SEND_BUF => {
                let v = value.as_i32()?;
                if v < 0 {
                    return Err(Error::InvalidArgument(format!("send-buf {v} is negative")));
                }
                *self.send_buf.lock().unwrap() = v;
                *self.send_buf_sem.lock().unwrap() = Arc::new(Semaphore::new(v as usize));
            }
            _ => return Err(Error::Unsupported),
        }
        Ok(())
    }

    /// Sets or clears the non-blocking flag (spec §4.8).
    pub fn set_nonblocking(&self, v: bool) {
        self.nonblocking.store(v, Ordering::Release);
    }
}

/// Waits for one free slot in a socket buffer (spec §8 "Buffer
/// semantics"). Non-blocking callers get an immediate `WouldBlock` if the
/// buffer is full; blocking callers wait up to `timeout` (or forever, if
/// `None`) for a slot to free up, surfacing `TimedOut` if it doesn't.
async fn acquire_buffer_slot(
    sem: Arc<Semaphore>,
    timeout: Option<Duration>,
    nonblocking: bool,
) -> Result<OwnedSemaphorePermit> {
    if nonblocking {
        return sem.try_acquire_owned().map_err(|_| Error::WouldBlock);
    }
    match timeout {
        Some(d) => tokio::time::timeout(d, sem.acquire_owned())
            .await
            .map_err(|_| Error::TimedOut)?
            .map_err(|_| Error::Closed),
        None => sem.acquire_owned().await.map_err(|_| Error::Closed),
    }
}

/// How much of `timeout` is left after spending `elapsed_since` waiting
/// for a buffer slot, so the actual transfer doesn't get a fresh full
/// timeout stacked on top of the wait (spec §8 property 2's "elapsed ≤ T
/// + small constant" bound covers the whole call, not just one stage of
/// it).
fn remaining_timeout(timeout: Option<Duration>, elapsed_since: Instant) -> Option<Duration> {
    timeout.map(|t| t.saturating_sub(elapsed_since.elapsed()))
}

/// In non-blocking mode, a zero-duration request that can't complete
/// immediately surfaces through the same `Aio` timeout machinery a real
/// timeout does; the socket layer re-labels that specific case as
/// *would-block* rather than *timed-out* (spec §8 property 3).
fn as_would_block(e: Error, nonblocking: bool) -> Error {
    if nonblocking && matches!(e, Error::TimedOut) {
        Error::WouldBlock
    } else {
        e
    }
}
