//! Linear device buffers and sub-buffer views.

use std::ptr::NonNull;
use std::sync::Arc;

use super::staging::StagingBuffer;
use super::{derive_properties, derive_usage, MemFlags, MemObjectType, MemoryCore, MemoryObject};
use crate::api::config::MemConfig;
use crate::api::handles::BufferHandle;
use crate::error::{check_range, MemError, MemResult};
use crate::gpu::{
    AllocationRequest, BufferUsage, Device, DeviceAllocation, DeviceCommand, MemoryProperties, ResourceUse, Serial,
};
use crate::sync::mutex::Mutex;

/// Largest fill pattern in bytes.
pub const MAX_PATTERN_SIZE: usize = 128;

/// Parameters a buffer's storage was allocated with, kept for recreation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCreateInfo {
    pub size: usize,
    pub usage: BufferUsage,
    pub properties: MemoryProperties,
}

/// Device allocation shared by a root buffer and its sub-buffer views.
pub(crate) struct BufferStorage {
    device: Arc<dyn Device>,
    allocation: DeviceAllocation,
    /// Host-visible copy used to map device-local storage.
    mirror: Mutex<StagingBuffer>,
    mirror_use: ResourceUse,
}

impl BufferStorage {
    fn is_host_visible(&self) -> bool {
        self.allocation.is_host_visible()
    }

    fn is_in_use(&self) -> bool {
        !self.device.has_resource_use_finished(self.allocation.resource_use())
            || !self.device.has_resource_use_finished(&self.mirror_use)
    }
}

impl Drop for BufferStorage {
    fn drop(&mut self) {
        self.device.free(&self.allocation);
    }
}

/// A linear, byte-addressable device buffer or a view over part of one.
pub struct BufferObject {
    core: MemoryCore,
    storage: Arc<BufferStorage>,
    offset: usize,
    size: usize,
    is_sub: bool,
    parent: Option<BufferHandle>,
    create_info: BufferCreateInfo,
    staging: Mutex<StagingBuffer>,
    staging_use: ResourceUse,
}

impl std::fmt::Debug for BufferObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferObject")
            .field("core", &self.core)
            .field("allocation", &self.storage.allocation.id())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("parent", &self.parent)
            .finish()
    }
}

impl BufferObject {
    /// Allocate a buffer of `size` bytes.
    ///
    /// `host` supplies the initial contents and must be given exactly when `flags`
    /// contains `USE_HOST_PTR` or `COPY_HOST_PTR`.
    pub fn create(
        device: Arc<dyn Device>,
        config: &MemConfig,
        flags: MemFlags,
        size: usize,
        host: Option<&[u8]>,
    ) -> MemResult<Self> {
        flags.validate()?;
        if size == 0 {
            return Err(MemError::InvalidValue("buffer size must be non-zero"));
        }
        let host = match (host, flags.needs_host_data()) {
            (Some(data), true) if data.len() < size => {
                return Err(MemError::InvalidValue("host data is smaller than the buffer"))
            }
            (Some(data), true) => Some(&data[..size]),
            (None, false) => None,
            (Some(_), false) => return Err(MemError::InvalidValue("host data given without a host pointer flag")),
            (None, true) => return Err(MemError::InvalidValue("host pointer flag given without host data")),
        };

        let create_info = BufferCreateInfo {
            size,
            usage: derive_usage(flags),
            properties: derive_properties(flags, config),
        };
        let allocation =
            device.allocate(&AllocationRequest::buffer(size, create_info.usage, create_info.properties))?;
        let storage = Arc::new(BufferStorage {
            device: device.clone(),
            allocation,
            mirror: Mutex::new(StagingBuffer::new(device.clone(), config)),
            mirror_use: ResourceUse::new(),
        });

        let buffer = Self::with_storage(device, config, flags, storage, 0, size, false, create_info);
        if let Some(data) = host {
            buffer.write_initial(data)?;
        }
        crate::dm_trace!("buffer created ({} bytes, {:?})", size, create_info.properties);
        Ok(buffer)
    }

    #[allow(clippy::too_many_arguments)]
    fn with_storage(
        device: Arc<dyn Device>,
        config: &MemConfig,
        flags: MemFlags,
        storage: Arc<BufferStorage>,
        offset: usize,
        size: usize,
        is_sub: bool,
        create_info: BufferCreateInfo,
    ) -> Self {
        Self {
            core: MemoryCore::new(device.clone(), config.clone(), MemObjectType::Buffer, flags, create_info.properties),
            staging: Mutex::new(StagingBuffer::new(device, config)),
            staging_use: ResourceUse::new(),
            storage,
            offset,
            size,
            is_sub,
            parent: None,
            create_info,
        }
    }

    /// Host-pointer buffers are always host-visible, so initial data goes straight in.
    fn write_initial(&self, data: &[u8]) -> MemResult<()> {
        let device = self.core.device();
        let base = device.map(&self.storage.allocation)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.as_ptr().add(self.offset), data.len());
        }
        device.unmap(&self.storage.allocation);
        Ok(())
    }

    pub fn is_sub_buffer(&self) -> bool {
        self.is_sub
    }

    /// Handle of the buffer this view was created from, when created through a context.
    pub fn parent(&self) -> Option<BufferHandle> {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: BufferHandle) {
        self.parent = Some(parent);
    }

    /// Allocation parameters of the backing storage.
    pub fn create_info(&self) -> BufferCreateInfo {
        self.create_info
    }

    /// Size of the shared backing allocation.
    pub fn storage_size(&self) -> usize {
        self.storage.allocation.size()
    }

    /// Whether `other` views the same backing allocation.
    pub fn shares_storage_with(&self, other: &BufferObject) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn allocation(&self) -> &DeviceAllocation {
        &self.storage.allocation
    }

    /// Make the caller-facing staging buffer at least `size` bytes.
    pub fn create_staging_buffer(&self, size: usize) -> MemResult<()> {
        self.staging.lock().ensure(size).map(|_| ())
    }

    pub fn staging_size(&self) -> usize {
        self.staging.lock().size()
    }

    /// Map the staging buffer. Growth fails until it is unmapped again.
    pub fn map_staging(&self) -> MemResult<NonNull<u8>> {
        self.staging.lock().map()
    }

    pub fn unmap_staging(&self) {
        self.staging.lock().unmap();
    }

    /// Copy `data` into the staging buffer at `offset`, growing it as needed.
    pub fn write_staging(&self, offset: usize, data: &[u8]) -> MemResult<()> {
        let mut staging = self.staging.lock();
        let end = offset
            .checked_add(data.len())
            .ok_or(MemError::out_of_bounds(offset, data.len(), usize::MAX))?;
        staging.ensure(end)?;
        staging.write(offset, data)
    }

    /// Record a copy of `size` staging bytes at `staging_offset` into the buffer at
    /// `offset`.
    pub fn flush_staging(&self, staging_offset: usize, offset: usize, size: usize) -> MemResult<Serial> {
        check_range(offset, size, self.size)?;
        let staging = self.staging.lock();
        check_range(staging_offset, size, staging.size())?;
        let src = staging
            .allocation()
            .ok_or(MemError::InvalidState("staging buffer was not allocated"))?
            .clone();
        let serial = self.core.device().submit(DeviceCommand::CopyBuffer {
            src,
            dst: self.storage.allocation.clone(),
            src_offset: staging_offset,
            dst_offset: self.offset + offset,
            size,
        })?;
        self.staging_use.record(serial);
        Ok(serial)
    }

    /// Record a device fill of `[offset, offset + size)` with a repeating pattern.
    pub fn fill_with_pattern(&self, pattern: &[u8], offset: usize, size: usize) -> MemResult<Serial> {
        let len = pattern.len();
        if len == 0 || !len.is_power_of_two() || len > MAX_PATTERN_SIZE {
            return Err(MemError::InvalidValue("pattern size must be a power of two up to 128"));
        }
        if offset % len != 0 || size % len != 0 {
            return Err(MemError::InvalidValue("offset and size must be multiples of the pattern size"));
        }
        check_range(offset, size, self.size)?;
        if size == 0 {
            return Err(MemError::InvalidValue("fill size must be non-zero"));
        }

        let serial = self.core.device().submit(DeviceCommand::FillBuffer {
            dst: self.storage.allocation.clone(),
            offset: self.offset + offset,
            size,
            pattern: pattern.to_vec(),
        })?;
        Ok(serial)
    }
}

impl MemoryObject for BufferObject {
    fn core(&self) -> &MemoryCore {
        &self.core
    }

    fn size(&self) -> usize {
        self.size
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn map_impl(&self) -> MemResult<NonNull<u8>> {
        let base = if self.storage.is_host_visible() {
            self.core.device().map(&self.storage.allocation)?
        } else {
            self.storage.mirror.lock().map()?
        };
        // SAFETY: offset + size lies within the storage and the mirror.
        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(self.offset)) })
    }

    fn unmap_impl(&self) {
        if self.storage.is_host_visible() {
            self.core.device().unmap(&self.storage.allocation);
        } else {
            self.storage.mirror.lock().unmap();
        }
    }

    fn prepare_map(&self) -> MemResult<()> {
        if self.storage.is_host_visible() {
            return Ok(());
        }
        let mut mirror = self.storage.mirror.lock();
        let dst = mirror.ensure(self.storage.allocation.size())?.clone();
        let device = self.core.device();
        let serial = device.submit(DeviceCommand::CopyBuffer {
            src: self.storage.allocation.clone(),
            dst,
            src_offset: self.offset,
            dst_offset: self.offset,
            size: self.size,
        })?;
        self.storage.mirror_use.record(serial);
        device.wait(serial)?;
        Ok(())
    }

    fn finish_unmap(&self) -> MemResult<()> {
        if self.storage.is_host_visible() {
            return Ok(());
        }
        let mirror = self.storage.mirror.lock();
        let src = mirror
            .allocation()
            .ok_or(MemError::InvalidState("device-local mirror was not allocated"))?
            .clone();
        let serial = self.core.device().submit(DeviceCommand::CopyBuffer {
            src,
            dst: self.storage.allocation.clone(),
            src_offset: self.offset,
            dst_offset: self.offset,
            size: self.size,
        })?;
        self.storage.mirror_use.record(serial);
        Ok(())
    }

    fn is_currently_in_use(&self) -> bool {
        let device = self.core.device();
        self.storage.is_in_use() || !device.has_resource_use_finished(&self.staging_use)
    }

    fn copy_to_object(&self, dst: &Self, src_offset: usize, dst_offset: usize, size: usize) -> MemResult<Serial> {
        if size == 0 {
            return Err(MemError::InvalidValue("copy size must be non-zero"));
        }
        check_range(src_offset, size, self.size)?;
        check_range(dst_offset, size, dst.size)?;
        let (from, to) = (self.offset + src_offset, dst.offset + dst_offset);
        if self.shares_storage_with(dst) && from < to + size && to < from + size {
            return Err(MemError::InvalidValue("source and destination ranges overlap"));
        }

        let serial = self.core.device().submit(DeviceCommand::CopyBuffer {
            src: self.storage.allocation.clone(),
            dst: dst.storage.allocation.clone(),
            src_offset: from,
            dst_offset: to,
            size,
        })?;
        Ok(serial)
    }

    fn create_sub_buffer(&self, flags: MemFlags, offset: usize, size: usize) -> MemResult<BufferObject> {
        if self.is_sub {
            return Err(MemError::InvalidState("sub-buffers cannot be nested"));
        }
        if size == 0 {
            return Err(MemError::InvalidValue("sub-buffer size must be non-zero"));
        }
        check_range(offset, size, self.size)?;
        let flags = flags.inherit(self.core.flags())?;

        Ok(Self::with_storage(
            self.core.device().clone(),
            self.core.config(),
            flags,
            self.storage.clone(),
            self.offset + offset,
            size,
            true,
            self.create_info,
        ))
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        let mut state = self.core.lock_map();
        if state.count > 0 {
            crate::dm_emit!(DM002, "buffer dropped with {} outstanding maps", state.count);
            self.unmap_impl();
            *state = Default::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HostDevice;

    fn setup() -> (Arc<HostDevice>, MemConfig) {
        (Arc::new(HostDevice::new()), MemConfig::default())
    }

    fn buffer(device: &Arc<HostDevice>, config: &MemConfig, size: usize) -> BufferObject {
        BufferObject::create(device.clone(), config, MemFlags::READ_WRITE, size, None).unwrap()
    }

    #[test]
    fn test_create_validation() {
        let (device, config) = setup();
        let zero = BufferObject::create(device.clone(), &config, MemFlags::READ_WRITE, 0, None);
        assert!(matches!(zero, Err(MemError::InvalidValue(_))));

        let data = [0u8; 16];
        let stray = BufferObject::create(device.clone(), &config, MemFlags::READ_WRITE, 16, Some(&data));
        assert!(matches!(stray, Err(MemError::InvalidValue(_))));

        let missing = BufferObject::create(device.clone(), &config, MemFlags::COPY_HOST_PTR, 16, None);
        assert!(matches!(missing, Err(MemError::InvalidValue(_))));

        let short = BufferObject::create(device.clone(), &config, MemFlags::COPY_HOST_PTR, 32, Some(&data));
        assert!(matches!(short, Err(MemError::InvalidValue(_))));
    }

    #[test]
    fn test_copy_host_ptr_populates() {
        let (device, config) = setup();
        let data: Vec<u8> = (0..64).collect();
        let buffer =
            BufferObject::create(device.clone(), &config, MemFlags::COPY_HOST_PTR, 64, Some(&data)).unwrap();
        let mut out = vec![0u8; 64];
        buffer.copy_to(&mut out, 0).unwrap();
        assert_eq!(out, data);
        assert_eq!(buffer.memory_property_flags(), MemoryProperties::HOST_VISIBLE);
    }

    #[test]
    fn test_round_trip() {
        let (device, config) = setup();
        let buffer = buffer(&device, &config, 256);
        buffer.copy_from(&[9, 8, 7], 100).unwrap();
        let mut out = [0u8; 3];
        buffer.copy_to(&mut out, 100).unwrap();
        assert_eq!(out, [9, 8, 7]);
        assert!(buffer.copy_from(&[1, 2], 255).is_err());
    }

    #[test]
    fn test_double_map_same_pointer() {
        let (device, config) = setup();
        let buffer = buffer(&device, &config, 128);
        let a = buffer.map(0).unwrap();
        let b = buffer.map(0).unwrap();
        assert_eq!(a, b);
        assert_eq!(buffer.map_count(), 2);

        buffer.unmap().unwrap();
        assert!(buffer.is_mapped());
        buffer.unmap().unwrap();
        assert!(!buffer.is_mapped());
        assert_eq!(device.map_count(buffer.allocation()), 0);

        // Extra unmap is a no-op.
        buffer.unmap().unwrap();
        assert_eq!(buffer.map_count(), 0);
    }

    #[test]
    fn test_map_offset_bounds() {
        let (device, config) = setup();
        let buffer = buffer(&device, &config, 64);
        let base = buffer.map(0).unwrap();
        let end = buffer.map(64).unwrap();
        assert_eq!(end.as_ptr() as usize - base.as_ptr() as usize, 64);
        assert!(matches!(buffer.map(65), Err(MemError::OutOfBounds { .. })));
        assert_eq!(buffer.map_count(), 2);
    }

    #[test]
    fn test_sub_buffer_bounds_and_sharing() {
        let (device, config) = setup();
        let parent = buffer(&device, &config, 1024);
        let sub = parent.create_sub_buffer(MemFlags::empty(), 256, 256).unwrap();
        assert!(sub.is_sub_buffer());
        assert_eq!(sub.offset(), 256);
        assert!(sub.offset() + sub.size() <= parent.size());
        assert!(sub.shares_storage_with(&parent));
        assert_eq!(sub.flags(), MemFlags::READ_WRITE);

        assert!(matches!(
            parent.create_sub_buffer(MemFlags::empty(), 900, 200),
            Err(MemError::OutOfBounds { .. })
        ));
        assert!(matches!(
            sub.create_sub_buffer(MemFlags::empty(), 0, 16),
            Err(MemError::InvalidState(_))
        ));

        sub.copy_from(&[0xEE; 4], 0).unwrap();
        let mut out = [0u8; 4];
        parent.copy_to(&mut out, 256).unwrap();
        assert_eq!(out, [0xEE; 4]);
    }

    #[test]
    fn test_fill_with_pattern() {
        let (device, config) = setup();
        let buffer = buffer(&device, &config, 64);
        assert!(buffer.fill_with_pattern(&[1, 2, 3], 0, 12).is_err());
        assert!(buffer.fill_with_pattern(&[0; 256], 0, 256).is_err());
        assert!(buffer.fill_with_pattern(&[1, 2], 1, 4).is_err());
        assert!(buffer.fill_with_pattern(&[1, 2], 0, 5).is_err());
        assert!(matches!(buffer.fill_with_pattern(&[1, 2], 62, 4), Err(MemError::OutOfBounds { .. })));

        let serial = buffer.fill_with_pattern(&[0xAB, 0xCD, 0xEF, 0x01], 8, 16).unwrap();
        assert!(buffer.is_currently_in_use());
        device.wait(serial).unwrap();
        assert!(!buffer.is_currently_in_use());

        let mut out = [0u8; 8];
        buffer.copy_to(&mut out, 4).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 0xAB, 0xCD, 0xEF, 0x01]);
    }

    #[test]
    fn test_sub_buffer_in_use_through_parent() {
        let (device, config) = setup();
        let parent = buffer(&device, &config, 256);
        let sub = parent.create_sub_buffer(MemFlags::empty(), 128, 64).unwrap();
        parent.fill_with_pattern(&[1], 0, 16).unwrap();
        assert!(sub.is_currently_in_use());
        device.finish().unwrap();
        assert!(!sub.is_currently_in_use());
    }

    #[test]
    fn test_copy_to_object() {
        let (device, config) = setup();
        let src = buffer(&device, &config, 64);
        let dst = buffer(&device, &config, 64);
        src.copy_from(&[5; 16], 0).unwrap();

        assert!(src.copy_to_object(&dst, 60, 0, 8).is_err());
        assert!(src.copy_to_object(&dst, 0, 60, 8).is_err());
        assert!(src.copy_to_object(&src, 0, 8, 16).is_err());

        let serial = src.copy_to_object(&dst, 0, 32, 16).unwrap();
        device.wait(serial).unwrap();
        let mut out = [0u8; 16];
        dst.copy_to(&mut out, 32).unwrap();
        assert_eq!(out, [5; 16]);
    }

    #[test]
    fn test_device_local_map_uses_mirror() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::device_local();
        let buffer = BufferObject::create(device.clone(), &config, MemFlags::READ_WRITE, 32, None).unwrap();
        assert_eq!(buffer.memory_property_flags(), MemoryProperties::DEVICE_LOCAL);

        buffer.copy_from(&[3; 32], 0).unwrap();
        device.finish().unwrap();
        assert_eq!(device.read_allocation(buffer.allocation()).unwrap(), vec![3; 32]);

        buffer.fill_with_pattern(&[7, 7, 7, 7], 0, 8).unwrap();
        let mut out = [0u8; 12];
        buffer.copy_to(&mut out, 0).unwrap();
        assert_eq!(out, [7, 7, 7, 7, 7, 7, 7, 7, 3, 3, 3, 3]);
    }

    #[test]
    fn test_staging_buffer_flush() {
        let (device, config) = setup();
        let buffer = buffer(&device, &config, 64);
        assert_eq!(buffer.staging_size(), 0);
        buffer.create_staging_buffer(16).unwrap();
        assert!(buffer.staging_size() >= 16);

        buffer.write_staging(0, &[4, 3, 2, 1]).unwrap();
        let serial = buffer.flush_staging(0, 10, 4).unwrap();
        assert!(buffer.is_currently_in_use());
        device.wait(serial).unwrap();
        let mut out = [0u8; 4];
        buffer.copy_to(&mut out, 10).unwrap();
        assert_eq!(out, [4, 3, 2, 1]);

        buffer.map_staging().unwrap();
        let grow = buffer.create_staging_buffer(buffer.staging_size() + 1);
        assert!(matches!(grow, Err(MemError::InvalidState(_))));
        buffer.unmap_staging();
    }

    #[test]
    fn test_host_access_flags() {
        let (device, config) = setup();
        let no_access =
            BufferObject::create(device.clone(), &config, MemFlags::HOST_NO_ACCESS, 16, None).unwrap();
        assert!(no_access.copy_from(&[1], 0).is_err());

        let read_only =
            BufferObject::create(device.clone(), &config, MemFlags::HOST_READ_ONLY, 16, None).unwrap();
        assert!(read_only.copy_from(&[1], 0).is_err());
        let mut out = [0u8; 1];
        assert!(read_only.copy_to(&mut out, 0).is_ok());
    }

    #[test]
    fn test_writable() {
        let (device, config) = setup();
        assert!(buffer(&device, &config, 16).is_writable());
        let ro = BufferObject::create(device.clone(), &config, MemFlags::READ_ONLY, 16, None).unwrap();
        assert!(!ro.is_writable());
    }
}
