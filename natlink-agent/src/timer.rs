//! Reusable timer pool.
//!
//! Thin wrapper over `tokio_util`'s [`DelayQueue`], which stores entries in
//! a slab so the retransmit/refresh workload reuses timer slots instead of
//! allocating per retry. The processor owns the pool; nothing else touches
//! it. Re-arming is always cancel-then-insert, so a binding never has two
//! timers in flight.

use std::time::Duration;

use tokio_util::time::delay_queue::DelayQueue;

use crate::store::BindingKey;

/// Opaque handle to one scheduled timer.
pub type TimerKey = tokio_util::time::delay_queue::Key;

/// Why a binding timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerPurpose {
    /// No response arrived within the response timeout.
    ResponseTimeout,
    /// A keepalive interval elapsed; start the next round.
    KeepaliveTick,
    /// A TURN allocation is nearing expiry; refresh it.
    RefreshDue,
}

/// A scheduled wakeup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// Per-binding timer.
    Binding {
        /// Binding the timer belongs to.
        key: BindingKey,
        /// What to do when it fires.
        purpose: TimerPurpose,
    },
    /// Periodic sweep of expired external bindings.
    SweepExternal,
}

/// Pool of schedulable timers backed by a [`DelayQueue`].
pub struct TimerPool {
    queue: DelayQueue<TimerEvent>,
}

impl TimerPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self { queue: DelayQueue::new() }
    }

    /// Schedule `event` to fire after `delay`.
    pub fn arm(&mut self, event: TimerEvent, delay: Duration) -> TimerKey {
        self.queue.insert(event, delay)
    }

    /// Cancel a scheduled timer. Returns whether it was still pending.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        self.queue.try_remove(key).is_some()
    }

    /// Drop every scheduled timer.
    pub fn clear(&mut self) {
        self.queue.clear();
    }

    /// Number of scheduled timers.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no timers are scheduled.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Wait for the next due timer. Resolves to `None` when the pool is
    /// empty, so callers embedding this in `select!` should keep at least
    /// one recurring timer armed.
    pub async fn next_due(&mut self) -> Option<TimerEvent> {
        futures::future::poll_fn(|cx| self.queue.poll_expired(cx))
            .await
            .map(|expired| expired.into_inner())
    }
}

impl Default for TimerPool {
    fn default() -> Self {
        Self::new()
    }
}
