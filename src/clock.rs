//! Monotonic clock and expiry queue.
//!
//! Every [`crate::aio::Aio`] deadline is armed against a single
//! [`DeadlineQueue`] per process (see [`global`]). This is the concrete form
//! of the "timed-wheel or heap-based expiry queue" leaf layer described by
//! the wider design: a binary heap keyed by [`Instant`], drained by one
//! background task that sleeps until the next deadline and fires whatever
//! is due.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

/// Opaque token identifying an armed deadline, used to cancel it before it
/// fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineHandle(u64);

type FireFn = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    deadline: Instant,
    id: u64,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want the earliest deadline first.
        Reverse(self.deadline).cmp(&Reverse(other.deadline))
    }
}

struct Shared {
    next_id: AtomicU64,
    notify: Notify,
    inner: Mutex<Inner>,
}

struct Inner {
    heap: BinaryHeap<Entry>,
    pending: HashMap<u64, FireFn>,
}

/// A heap-backed deadline queue with a single background draining task.
pub struct DeadlineQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for DeadlineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadlineQueue").finish_non_exhaustive()
    }
}

impl DeadlineQueue {
    fn new() -> Self {
        let shared = Arc::new(Shared {
            next_id: AtomicU64::new(1),
            notify: Notify::new(),
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                pending: HashMap::new(),
            }),
        });

        tokio::spawn(Self::run(shared.clone()));

        Self { shared }
    }

    async fn run(shared: Arc<Shared>) {
        loop {
            let sleep_until = {
                let inner = shared.inner.lock().unwrap();
                inner.heap.peek().map(|e| e.deadline)
            };

            match sleep_until {
                None => shared.notify.notified().await,
                Some(when) => {
                    let sleep = tokio::time::sleep_until(when.into());
                    tokio::select! {
                        _ = sleep => {},
                        _ = shared.notify.notified() => continue,
                    }
                }
            }

            let now = Instant::now();
            let mut due = Vec::new();
            {
                let mut inner = shared.inner.lock().unwrap();
                while let Some(top) = inner.heap.peek() {
                    if top.deadline > now {
                        break;
                    }
                    let entry = inner.heap.pop().unwrap();
                    if let Some(f) = inner.pending.remove(&entry.id) {
                        due.push(f);
                    }
                }
            }
            for f in due {
                f();
            }
        }
    }

    /// Arm `fire` to run after `dur` elapses. Returns a handle that can be
    /// passed to [`DeadlineQueue::cancel`].
    pub fn arm(&self, dur: Duration, fire: impl FnOnce() + Send + 'static) -> DeadlineHandle {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + dur;
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.pending.insert(id, Box::new(fire));
            inner.heap.push(Entry { deadline, id });
        }
        self.shared.notify.notify_one();
        DeadlineHandle(id)
    }

    /// Cancel a previously armed deadline. A no-op if it already fired.
    pub fn cancel(&self, handle: DeadlineHandle) {
        let mut inner = self.shared.inner.lock().unwrap();
        inner.pending.remove(&handle.0);
        // The stale heap entry is skipped lazily in `run` since its id is
        // no longer present in `pending`.
    }
}

static GLOBAL: OnceLock<DeadlineQueue> = OnceLock::new();

/// The process-wide deadline queue every [`crate::aio::Aio`] schedules its
/// timeout against.
pub fn global() -> &'static DeadlineQueue {
    GLOBAL.get_or_init(DeadlineQueue::new)
}
