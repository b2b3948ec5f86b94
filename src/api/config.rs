//! Memory-object configuration.

use crate::util::size::kb;

/// Configuration shared by every memory object created through a context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemConfig {
    /// Row alignment of image staging layouts in bytes, a power of two (default: 1)
    pub row_alignment: usize,

    /// Staging buffers are sized in multiples of this (default: 4 KiB)
    pub staging_granularity: usize,

    /// Place buffers without a host pointer in device-local memory
    pub device_local_buffers: bool,

    /// Enable debug features (poisoning of fresh staging memory)
    pub debug_mode: bool,
}

impl Default for MemConfig {
    fn default() -> Self {
        Self {
            row_alignment: 1,
            staging_granularity: kb(4),
            device_local_buffers: false,
            debug_mode: cfg!(feature = "debug"),
        }
    }
}

impl MemConfig {
    /// Create a config that keeps plain buffers in device-local memory.
    ///
    /// Mapping such a buffer goes through a host-visible mirror.
    pub fn device_local() -> Self {
        Self {
            device_local_buffers: true,
            ..Self::default()
        }
    }

    /// Builder pattern: set image row alignment. Non powers of two are rounded up.
    pub fn with_row_alignment(mut self, alignment: usize) -> Self {
        self.row_alignment = alignment.max(1).next_power_of_two();
        self
    }

    /// Builder pattern: set staging granularity (minimum 1 byte).
    pub fn with_staging_granularity(mut self, granularity: usize) -> Self {
        self.staging_granularity = granularity.max(1);
        self
    }

    /// Builder pattern: place buffers in device-local memory.
    pub fn with_device_local_buffers(mut self, enable: bool) -> Self {
        self.device_local_buffers = enable;
        self
    }

    /// Builder pattern: enable debug mode.
    pub fn with_debug(mut self, enable: bool) -> Self {
        self.debug_mode = enable;
        self
    }
}
