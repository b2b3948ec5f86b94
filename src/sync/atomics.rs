//! Atomic helpers for device statistics and serials.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A monotonically increasing counter (submitted commands, map calls).
#[derive(Debug)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Create a new counter.
    pub const fn new(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Increment the counter and return the new value.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Raise the counter to `value` if it is currently lower.
    pub fn advance_to(&self, value: u64) {
        self.0.fetch_max(value, Ordering::AcqRel);
    }

    /// Get the current value.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for AtomicCounter {
    fn default() -> Self {
        Self::new(0)
    }
}

/// An atomic gauge for byte totals that go up and down, with a high-water mark.
#[derive(Debug, Default)]
pub struct AtomicGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl AtomicGauge {
    /// Create a new gauge.
    pub const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Add `value` only if the result stays within `limit`, updating the peak.
    ///
    /// Returns the new total, or the current total when the reservation does not fit.
    pub fn try_add(&self, value: usize, limit: usize) -> Result<usize, usize> {
        let previous = self.current.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
            current.checked_add(value).filter(|&total| total <= limit)
        })?;
        let now = previous + value;
        self.peak.fetch_max(now, Ordering::Relaxed);
        Ok(now)
    }

    /// Subtract from the gauge.
    pub fn sub(&self, value: usize) -> usize {
        self.current.fetch_sub(value, Ordering::Relaxed) - value
    }

    /// Get the current value.
    pub fn get(&self) -> usize {
        self.current.load(Ordering::Relaxed)
    }

    /// Highest value observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Relaxed)
    }
}
