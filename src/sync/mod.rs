//! Synchronization primitives.
//!
//! Provides thin wrappers over std or parking_lot mutexes, plus atomic
//! counters used for serials and device statistics.

pub(crate) mod atomics;
pub(crate) mod mutex;
