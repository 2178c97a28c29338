//! Monotonic millisecond clock
//!
//! The node counts time in `u32` milliseconds since startup, the way the
//! device's own tick counter does. It wraps after roughly 49.7 days, so every
//! elapsed-time comparison must use `wrapping_sub`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Milliseconds on the node's monotonic clock
pub type Millis = u32;

/// Source of monotonic time
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Millis;
}

/// Milliseconds elapsed from `since` to `now`, tolerant of counter wraparound
pub fn elapsed_ms(now: Millis, since: Millis) -> Millis {
    now.wrapping_sub(since)
}

/// Process-local clock backed by `Instant`
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> Millis {
        // Truncation is the wraparound
        self.start.elapsed().as_millis() as Millis
    }
}

/// Hand-driven clock for tests and simulations
///
/// Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU32>,
}

impl ManualClock {
    pub fn new(start: Millis) -> Self {
        Self {
            now: Arc::new(AtomicU32::new(start)),
        }
    }

    pub fn set(&self, now: Millis) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Advance by `delta`, wrapping like the device counter
    pub fn advance(&self, delta: Millis) -> Millis {
        let previous = self
            .now
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.wrapping_add(delta))
            })
            .unwrap_or_else(|current| current);
        previous.wrapping_add(delta)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}
