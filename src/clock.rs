//! Logical clock for trace marks
//!
//! Marks are stamped with a logical time rather than wall-clock time so that
//! their position is tied to the trace stream itself. The clock is a
//! monotonically non-decreasing counter: it only ever advances.
//!
//! # Example
//!
//! ```
//! use memtrace_convert::clock::LogicalClock;
//!
//! let clock = LogicalClock::new();
//! clock.advance(4096);
//! clock.advance(512);
//! assert_eq!(clock.now(), 4608);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic logical clock
///
/// Thread-safe; reads and advances are single atomic operations, so a clock
/// can be read from a handler thread while the reader thread advances it.
#[derive(Debug)]
pub struct LogicalClock {
    counter: AtomicU64,
}

impl LogicalClock {
    /// Create a new clock starting at 0
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Advance by `delta`, returning the new value
    ///
    /// Saturates at `u64::MAX` instead of wrapping.
    pub fn advance(&self, delta: u64) -> u64 {
        let mut current = self.counter.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_add(delta);
            match self.counter.compare_exchange_weak(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    /// Current reading without advancing
    pub fn now(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for LogicalClock {
    fn default() -> Self {
        Self::new()
    }
}
