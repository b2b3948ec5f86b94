//! Host-visible staging buffers.
//!
//! A staging buffer is allocated on first use and only ever grows. Growing replaces the
//! allocation (the old one is handed back to the device, which defers the free while
//! commands still reference it) and discards the previous contents.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::api::config::MemConfig;
use crate::error::{check_range, MemError, MemResult};
use crate::gpu::{AllocationRequest, BufferUsage, Device, DeviceAllocation, MemoryProperties};
use crate::util::layout::round_up;

/// Byte written over fresh staging memory in debug mode.
pub const POISON_BYTE: u8 = 0xCD;

/// Lazily allocated, grow-only host-visible scratch buffer.
pub struct StagingBuffer {
    device: Arc<dyn Device>,
    allocation: Option<DeviceAllocation>,
    granularity: usize,
    poison: bool,
    map_count: u32,
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("size", &self.size())
            .field("map_count", &self.map_count)
            .finish()
    }
}

impl StagingBuffer {
    /// Create an empty staging buffer. Nothing is allocated until [`ensure`](Self::ensure).
    pub fn new(device: Arc<dyn Device>, config: &MemConfig) -> Self {
        Self {
            device,
            allocation: None,
            granularity: config.staging_granularity.max(1),
            poison: config.debug_mode,
            map_count: 0,
        }
    }

    /// Current capacity in bytes (0 before the first allocation).
    pub fn size(&self) -> usize {
        self.allocation.as_ref().map_or(0, DeviceAllocation::size)
    }

    pub fn allocation(&self) -> Option<&DeviceAllocation> {
        self.allocation.as_ref()
    }

    pub fn is_mapped(&self) -> bool {
        self.map_count > 0
    }

    /// Make sure at least `size` bytes are available and return the allocation.
    ///
    /// Growth is refused while the buffer is mapped since it would invalidate the
    /// outstanding pointer.
    pub fn ensure(&mut self, size: usize) -> MemResult<&DeviceAllocation> {
        if size == 0 {
            return Err(MemError::InvalidValue("staging size must be non-zero"));
        }
        if self.size() < size {
            self.grow(size)?;
        }
        self.allocation
            .as_ref()
            .ok_or(MemError::InvalidState("staging buffer was not allocated"))
    }

    fn grow(&mut self, size: usize) -> MemResult<()> {
        if self.map_count > 0 {
            crate::dm_emit!(DM102, "{} bytes requested, {} available", size, self.size());
            return Err(MemError::InvalidState("staging buffer is mapped"));
        }

        let capacity = round_up(size, self.granularity).ok_or(MemError::InvalidValue("staging size overflows"))?;
        let request = AllocationRequest::buffer(
            capacity,
            BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
        );
        let allocation = self.device.allocate(&request)?;

        if self.poison {
            let base = self.device.map(&allocation)?;
            unsafe {
                ptr::write_bytes(base.as_ptr(), POISON_BYTE, capacity);
            }
            self.device.unmap(&allocation);
        }

        if let Some(old) = self.allocation.replace(allocation) {
            crate::dm_emit!(DM101, "{} -> {} bytes", old.size(), capacity);
            self.device.free(&old);
        } else {
            crate::dm_trace!("staging allocated ({} bytes)", capacity);
        }
        Ok(())
    }

    /// Map the buffer. Every call must be balanced by [`unmap`](Self::unmap).
    pub fn map(&mut self) -> MemResult<NonNull<u8>> {
        let allocation = self
            .allocation
            .as_ref()
            .ok_or(MemError::InvalidState("staging buffer was not allocated"))?;
        let base = self.device.map(allocation)?;
        self.map_count += 1;
        Ok(base)
    }

    pub fn unmap(&mut self) {
        if self.map_count == 0 {
            return;
        }
        if let Some(allocation) = &self.allocation {
            self.device.unmap(allocation);
        }
        self.map_count -= 1;
    }

    /// Run `f` over the first `len` bytes of the mapped buffer.
    pub fn with_mapped<R>(&mut self, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> MemResult<R> {
        check_range(0, len, self.size())?;
        let base = self.map()?;
        // SAFETY: the allocation is at least `len` bytes and stays alive while mapped;
        // `&mut self` keeps other staging accesses out for the duration.
        let bytes = unsafe { std::slice::from_raw_parts_mut(base.as_ptr(), len) };
        let result = f(bytes);
        self.unmap();
        Ok(result)
    }

    /// Copy `src` into the buffer at `offset`.
    pub fn write(&mut self, offset: usize, src: &[u8]) -> MemResult<()> {
        check_range(offset, src.len(), self.size())?;
        self.with_mapped(offset + src.len(), |bytes| bytes[offset..].copy_from_slice(src))
    }

    /// Copy bytes at `offset` out into `dst`.
    pub fn read(&mut self, offset: usize, dst: &mut [u8]) -> MemResult<()> {
        check_range(offset, dst.len(), self.size())?;
        self.with_mapped(offset + dst.len(), |bytes| dst.copy_from_slice(&bytes[offset..]))
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            while self.map_count > 0 {
                self.device.unmap(&allocation);
                self.map_count -= 1;
            }
            self.device.free(&allocation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HostDevice;

    fn staging(config: &MemConfig) -> (Arc<HostDevice>, StagingBuffer) {
        let device = Arc::new(HostDevice::new());
        let staging = StagingBuffer::new(device.clone(), config);
        (device, staging)
    }

    #[test]
    fn test_lazy_and_rounded() {
        let (device, mut staging) = staging(&MemConfig::default().with_debug(false));
        assert_eq!(staging.size(), 0);
        assert_eq!(device.stats().live_allocations, 0);

        staging.ensure(100).unwrap();
        assert_eq!(staging.size(), 4096);
        assert_eq!(device.stats().live_allocations, 1);
    }

    #[test]
    fn test_grow_only() {
        let config = MemConfig::default().with_staging_granularity(64).with_debug(false);
        let (device, mut staging) = staging(&config);
        staging.ensure(100).unwrap();
        assert_eq!(staging.size(), 128);

        staging.ensure(10).unwrap();
        assert_eq!(staging.size(), 128);

        staging.ensure(300).unwrap();
        assert_eq!(staging.size(), 320);
        assert_eq!(device.stats().live_allocations, 1);
    }

    #[test]
    fn test_growth_while_mapped_fails() {
        let config = MemConfig::default().with_staging_granularity(16).with_debug(false);
        let (_device, mut staging) = staging(&config);
        staging.ensure(16).unwrap();
        staging.map().unwrap();

        assert!(matches!(staging.ensure(64), Err(MemError::InvalidState(_))));
        assert_eq!(staging.size(), 16);

        staging.unmap();
        assert!(staging.ensure(64).is_ok());
    }

    #[test]
    fn test_poisoned_in_debug_mode() {
        let config = MemConfig::default().with_staging_granularity(8).with_debug(true);
        let (_device, mut staging) = staging(&config);
        staging.ensure(8).unwrap();
        let mut out = [0u8; 8];
        staging.read(0, &mut out).unwrap();
        assert_eq!(out, [POISON_BYTE; 8]);
    }

    #[test]
    fn test_read_write() {
        let (_device, mut staging) = staging(&MemConfig::default());
        staging.ensure(32).unwrap();
        staging.write(4, &[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        staging.read(4, &mut out).unwrap();
        assert_eq!(out, [1, 2, 3]);
        assert!(staging.write(staging.size() - 1, &[0, 0]).is_err());
    }

    #[test]
    fn test_drop_frees() {
        let (device, mut staging) = staging(&MemConfig::default());
        staging.ensure(32).unwrap();
        drop(staging);
        assert_eq!(device.stats().live_allocations, 0);
    }
}
