//! Asynchronous I/O operations.
//!
//! Every potentially-blocking operation in this crate — stream send/recv,
//! accept/connect, SP negotiation, sleep — is expressed as an [`Aio`]: a
//! single-completion, cancellable, timeout-aware unit of work. A provider
//! (the pipe's stream, the endpoint's dialer/listener) calls
//! [`Aio::schedule`] on entry to register a cancellation callback, then
//! either [`Aio::finish`] (dispatched back through the runtime) or
//! [`Aio::finish_sync`] (invoked inline, for hot paths that already run on
//! a worker task) exactly once.
//!
//! This mirrors nng's `nng_aio`, with one deliberate idiomatic departure:
//! the C API pairs a `cancel_cb` with an opaque `cookie` pointer, because C
//! has no closures. Here `schedule` simply takes an `FnOnce(Error)` that
//! captures whatever state it needs — a plain Rust closure is already the
//! "cookie".

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use crate::clock::{self, DeadlineHandle};
use crate::error::Error;

/// The result delivered to an [`Aio`]'s completion callback.
#[derive(Debug)]
#[must_use]
pub enum AioResult {
    /// A send completed successfully.
    SendOk,
    /// A send failed.
    SendErr(Error),
    /// A receive completed successfully, yielding the bytes transferred.
    RecvOk(usize),
    /// A receive failed.
    RecvErr(Error),
    /// A sleep completed successfully.
    SleepOk,
    /// A sleep was aborted (timeout raced it, or it was cancelled).
    SleepErr(Error),
    /// An endpoint `connect`/`accept` matched a waiting pipe (spec §4.4
    /// "Matching"). The matched pipe is in the aio's output slot.
    MatchOk,
    /// An endpoint `connect`/`accept` failed outright (closed endpoint,
    /// dial refused with no further retry, etc).
    MatchErr(Error),
}

impl AioResult {
    /// Projects a result down to `Result<(), Error>`, discarding any
    /// byte count. Convenient for callers that only care whether the
    /// operation succeeded.
    pub fn into_result(self) -> Result<(), Error> {
        use AioResult::*;
        match self {
            SendOk | SleepOk | MatchOk => Ok(()),
            RecvOk(_) => Ok(()),
            SendErr(e) | RecvErr(e) | SleepErr(e) | MatchErr(e) => Err(e),
        }
    }
}

type CompletionFn = dyn Fn(Aio, AioResult) + Send + Sync + 'static;
type CancelFn = Box<dyn FnOnce(Error) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Not currently carrying out an operation.
    Inactive,
    /// `begin` succeeded; waiting for the provider to call `schedule`.
    Begun,
    /// `schedule` succeeded; a cancel callback is registered and a
    /// provider operation is in flight.
    Scheduled,
}

struct Mutable {
    state: State,
    cancel: Option<CancelFn>,
    deadline: Option<DeadlineHandle>,
    timeout: Option<Duration>,
    /// Set when `abort` ran ahead of `schedule` (the provider hasn't
    /// called `schedule` yet but the caller already wants out).
    pending_abort: Option<Error>,
    in_callback: bool,
}

/// A single-completion asynchronous I/O handle.
///
/// Cloning an `Aio` is cheap and shares the same underlying operation —
/// the clone handed to the completion callback is the same logical handle
/// the caller holds, mirroring nng's reference-counted `nng_aio`.
#[derive(Clone)]
pub struct Aio {
    inner: Arc<Inner>,
}

struct Inner {
    callback: Box<CompletionFn>,
    mutable: Mutex<Mutable>,
    idle: Notify,
    /// A scratch slot a provider can stash a typed result into ahead of
    /// completion — the received [`crate::message::Message`] on a pipe
    /// recv, the matched pipe on a dialer/listener aio — read back by the
    /// caller once the callback fires. `AioResult` alone only carries a
    /// byte count or an error.
    output: Mutex<Option<Box<dyn Any + Send>>>,
}

impl fmt::Debug for Aio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aio").finish_non_exhaustive()
    }
}

impl Aio {
    /// Allocates a new aio with the given completion callback.
    ///
    /// The callback runs once per completed operation, never concurrently
    /// with itself for the same `Aio`, and must not block.
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Aio, AioResult) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                callback: Box::new(callback),
                mutable: Mutex::new(Mutable {
                    state: State::Inactive,
                    cancel: None,
                    deadline: None,
                    timeout: None,
                    pending_abort: None,
                    in_callback: false,
                }),
                idle: Notify::new(),
                output: Mutex::new(None),
            }),
        }
    }

    /// Stashes a typed value into the output slot, overwriting whatever
    /// was there. Called by a provider before completing the aio.
    pub async fn set_output<T: Send + 'static>(&self, value: T) {
        *self.inner.output.lock().await = Some(Box::new(value));
    }

    /// Takes the output slot's value if it was set and is of type `T`.
    /// Leaves the slot empty either way.
    pub async fn take_output<T: Send + 'static>(&self) -> Option<T> {
        let boxed = self.inner.output.lock().await.take()?;
        match boxed.downcast::<T>() {
            Ok(v) => Some(*v),
            Err(_) => None,
        }
    }

    /// Marks the aio live. Fails with [`Error::Busy`] if it is already in
    /// flight.
    pub async fn begin(&self) -> Result<(), Error> {
        let mut m = self.inner.mutable.lock().await;
        if m.state != State::Inactive {
            return Err(Error::Busy);
        }
        m.state = State::Begun;
        m.pending_abort = None;
        drop(m);
        *self.inner.output.lock().await = None;
        Ok(())
    }

    /// Sets (or clears) the timeout for the next operation. Only valid
    /// while the aio is inactive.
    pub async fn set_timeout(&self, dur: Option<Duration>) -> Result<(), Error> {
        let mut m = self.inner.mutable.lock().await;
        if m.state == State::Scheduled {
            return Err(Error::Busy);
        }
        m.timeout = dur;
        Ok(())
    }

    /// Registers the provider's cancellation callback and arms the
    /// timeout, if one is set. Called by a provider immediately before it
    /// starts the underlying operation.
    ///
    /// Returns the abort error immediately if the aio was aborted between
    /// `begin` and `schedule` (spec §4.1: "fails immediately with the
    /// cancellation rv if the aio was already aborted").
    pub async fn schedule<C>(&self, cancel: C) -> Result<(), Error>
    where
        C: FnOnce(Error) + Send + 'static,
    {
        let mut m = self.inner.mutable.lock().await;
        if let Some(rv) = m.pending_abort.take() {
            return Err(rv);
        }
        m.state = State::Scheduled;
        m.cancel = Some(Box::new(cancel));
        if let Some(dur) = m.timeout {
            let inner = self.inner.clone();
            let handle = clock::global().arm(dur, move || {
                inner_abort(inner, Error::TimedOut);
            });
            m.deadline = Some(handle);
        }
        Ok(())
    }

    /// Aborts the in-flight (or not-yet-scheduled) operation with `rv`.
    /// Invokes the registered cancel callback, which is responsible for
    /// arranging a subsequent [`Aio::finish`]/[`Aio::finish_sync`] with
    /// this same error.
    pub fn abort(&self, rv: Error) {
        inner_abort(self.inner.clone(), rv);
    }

    /// Completes the operation, dispatching the callback through the
    /// runtime (modeling delivery via the worker-thread completion
    /// queue). Use [`Aio::finish_sync`] when already running on a worker
    /// task and inline delivery is acceptable.
    pub fn finish(&self, result: AioResult) {
        let aio = self.clone();
        tokio::spawn(async move {
            aio.complete(result).await;
        });
    }

    /// Completes the operation, invoking the callback inline on the
    /// caller's own task — no handoff through the runtime's task queue.
    /// Every call site in this crate is already running on a worker task
    /// (a pipe's send/recv pump, an endpoint's match), so there is no
    /// reentrancy concern `finish`'s detour through `tokio::spawn` is
    /// guarding against.
    pub async fn finish_sync(&self, result: AioResult) {
        self.complete(result).await;
    }

    async fn complete(&self, result: AioResult) {
        {
            let mut m = self.inner.mutable.lock().await;
            if let Some(handle) = m.deadline.take() {
                clock::global().cancel(handle);
            }
            m.cancel = None;
            m.state = State::Inactive;
            m.in_callback = true;
        }
        (self.inner.callback)(self.clone(), result);
        {
            let mut m = self.inner.mutable.lock().await;
            m.in_callback = false;
        }
        self.inner.idle.notify_waiters();
    }

    /// True if `self` and `other` are clones of the same underlying
    /// operation. Used by providers that hold a plain `Aio` in a queue and
    /// need to find it again from a cancel callback.
    pub fn ptr_eq(&self, other: &Aio) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Awaits the completion of any callback currently running for this
    /// aio and forbids any further operation from starting. After this
    /// returns, it is safe to destroy resources the callback might have
    /// touched.
    pub async fn stop(&self) {
        loop {
            {
                let m = self.inner.mutable.lock().await;
                if !m.in_callback && m.state != State::Scheduled {
                    return;
                }
            }
            self.inner.idle.notified().await;
        }
    }
}

fn inner_abort(inner: Arc<Inner>, rv: Error) {
    tokio::spawn(async move {
        let cancel = {
            let mut m = inner.mutable.lock().await;
            match m.state {
                State::Inactive => return,
                State::Begun => {
                    m.pending_abort = Some(rv);
                    return;
                }
                State::Scheduled => {
                    if let Some(handle) = m.deadline.take() {
                        clock::global().cancel(handle);
                    }
                    m.cancel.take()
                }
            }
        };
        if let Some(cancel) = cancel {
            cancel(rv);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn begin_twice_is_busy() {
        let aio = Aio::new(|_, _| {});
        aio.begin().await.unwrap();
        assert!(matches!(aio.begin().await, Err(Error::Busy)));
    }

    #[tokio::test]
    async fn abort_before_schedule_is_delivered_to_schedule() {
        let aio = Aio::new(|_, _| {});
        aio.begin().await.unwrap();
        aio.abort(Error::Closed);
        // give the spawned abort task a chance to run
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        let got_err = aio.schedule(|_| {}).await;
        assert!(matches!(got_err, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn finish_sync_invokes_callback_once() {
        let called = Arc::new(AtomicBool::new(false));
        let called2 = called.clone();
        let aio = Aio::new(move |_, res| {
            assert!(matches!(res, AioResult::SendOk));
            called2.store(true, Ordering::SeqCst);
        });
        aio.begin().await.unwrap();
        aio.schedule(|_| {}).await.unwrap();
        aio.finish_sync(AioResult::SendOk).await;
        aio.stop().await;
        assert!(called.load(Ordering::SeqCst));
    }
}
