//! Deferred, idempotent destruction.
//!
//! The original transport defers a pipe's teardown onto a dedicated
//! `nni_reap_list` worker thread, because freeing it inline from a callback
//! that is itself running on the pipe's own task queue can deadlock. This
//! crate's pipes and endpoints are plain `Arc`-counted async tasks — dropping
//! the last handle is the only "destructor", and there is no taskq thread to
//! deadlock against — so the queue itself has no counterpart here. What does
//! carry over is the one-shot guard: several code paths (a pipe's own
//! negotiation failure, its endpoint's `close`) can race to tear the same
//! object down, and only the first should run the teardown body.

use std::sync::atomic::{AtomicBool, Ordering};

/// A one-shot flag guaranteeing an object is only ever torn down once, even
/// if multiple code paths race to close it (e.g. a pipe's own negotiation
/// failure and its endpoint's close both observing the same object).
#[derive(Debug, Default)]
pub struct ReapGuard(AtomicBool);

impl ReapGuard {
    /// Returns `true` the first time it is called; `false` on every
    /// subsequent call.
    pub fn mark(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reap_guard_fires_once() {
        let g = ReapGuard::default();
        assert!(g.mark());
        assert!(!g.mark());
        assert!(!g.mark());
    }
}
