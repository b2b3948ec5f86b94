//! Public API for devmem.
//!
//! Configuration, generational handles and the [`context::MemoryContext`] arena that
//! owns objects created through it.

pub mod config;
pub mod context;
pub mod handles;
