//! Monotonic sequence-number source.
//!
//! Sequence numbers start at 1 and wrap back to 1 once they would exceed
//! [`Counter::CEILING`]. `0` is reserved on the wire to mean "no specific
//! call" and is never issued.

use std::sync::atomic::{AtomicU32, Ordering};

/// Lock-free counter handing out successive positive sequence numbers.
#[derive(Debug)]
pub struct Counter {
    /// The value `next()` will return.
    next: AtomicU32,
}

impl Counter {
    /// Largest value ever issued; the next one wraps back to 1.
    pub const CEILING: u32 = i32::MAX as u32;

    /// Create a counter whose first `next()` returns 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(1),
        }
    }

    /// Take the next sequence number and advance.
    pub fn next(&self) -> u32 {
        let mut cur = self.next.load(Ordering::Relaxed);
        loop {
            let after = if cur >= Self::CEILING { 1 } else { cur + 1 };
            match self
                .next
                .compare_exchange_weak(cur, after, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return cur,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Look at the value `next()` would return, without advancing.
    pub fn peek(&self) -> u32 {
        self.next.load(Ordering::Acquire)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}
