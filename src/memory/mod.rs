//! Memory objects.
//!
//! Buffers and images share the [`MemoryObject`] capability set: map/unmap with a
//! reference-counted host pointer, host copies, and the non-blocking in-use query.
//! Kind-specific operations (sub-buffers, pattern fills, pitches, pixel fills) live on
//! the concrete [`BufferObject`] and [`ImageObject`] types.

pub mod buffer;
pub mod image;
pub mod staging;

pub use buffer::{BufferCreateInfo, BufferObject};
pub use image::{ImageCopyWith, ImageDescriptor, ImageObject, StagingCopy};
pub use staging::StagingBuffer;

use std::ptr::NonNull;
use std::sync::Arc;

use bitflags::bitflags;

use crate::api::config::MemConfig;
use crate::error::{check_range, MemError, MemResult};
use crate::gpu::{BufferUsage, Device, MemoryProperties, Serial};
use crate::sync::mutex::{Mutex, MutexGuard};

bitflags! {
    /// Host-side creation flags (OpenCL `cl_mem_flags` numbering).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemFlags: u32 {
        const READ_WRITE = 1 << 0;
        const WRITE_ONLY = 1 << 1;
        const READ_ONLY = 1 << 2;
        const USE_HOST_PTR = 1 << 3;
        const ALLOC_HOST_PTR = 1 << 4;
        const COPY_HOST_PTR = 1 << 5;
        const HOST_WRITE_ONLY = 1 << 7;
        const HOST_READ_ONLY = 1 << 8;
        const HOST_NO_ACCESS = 1 << 9;
    }
}

impl MemFlags {
    /// Device access flags.
    pub const ACCESS: MemFlags = MemFlags::READ_WRITE.union(MemFlags::WRITE_ONLY).union(MemFlags::READ_ONLY);
    /// Flags that tie the object to host memory.
    pub const HOST_PTR: MemFlags = MemFlags::USE_HOST_PTR
        .union(MemFlags::ALLOC_HOST_PTR)
        .union(MemFlags::COPY_HOST_PTR);
    /// Host access restrictions.
    pub const HOST_ACCESS: MemFlags = MemFlags::HOST_WRITE_ONLY
        .union(MemFlags::HOST_READ_ONLY)
        .union(MemFlags::HOST_NO_ACCESS);

    /// Reject mutually exclusive combinations.
    pub fn validate(self) -> MemResult<()> {
        if (self & Self::ACCESS).bits().count_ones() > 1 {
            return Err(MemError::InvalidValue("more than one device access flag"));
        }
        if (self & Self::HOST_ACCESS).bits().count_ones() > 1 {
            return Err(MemError::InvalidValue("more than one host access flag"));
        }
        if self.contains(Self::USE_HOST_PTR) && self.intersects(Self::ALLOC_HOST_PTR | Self::COPY_HOST_PTR) {
            return Err(MemError::InvalidValue("USE_HOST_PTR excludes ALLOC_HOST_PTR and COPY_HOST_PTR"));
        }
        Ok(())
    }

    /// Whether creation must be given initial host contents.
    pub fn needs_host_data(self) -> bool {
        self.intersects(MemFlags::USE_HOST_PTR | MemFlags::COPY_HOST_PTR)
    }

    /// Flags of a sub-buffer: unspecified access and host-access flags come from the
    /// parent, host-pointer flags always do.
    pub fn inherit(self, parent: MemFlags) -> MemResult<MemFlags> {
        if self.intersects(Self::HOST_PTR) {
            return Err(MemError::InvalidValue("sub-buffers cannot set host pointer flags"));
        }
        let mut flags = self | (parent & Self::HOST_PTR);
        if !self.intersects(Self::ACCESS) {
            flags |= parent & Self::ACCESS;
        }
        if !self.intersects(Self::HOST_ACCESS) {
            flags |= parent & Self::HOST_ACCESS;
        }
        flags.validate()?;
        Ok(flags)
    }
}

/// Concrete kind of a memory object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemObjectType {
    Buffer,
    Image1D,
    Image1DBuffer,
    Image1DArray,
    Image2D,
    Image2DArray,
    Image3D,
}

impl MemObjectType {
    pub const fn is_image(self) -> bool {
        !matches!(self, MemObjectType::Buffer)
    }

    pub const fn is_array(self) -> bool {
        matches!(self, MemObjectType::Image1DArray | MemObjectType::Image2DArray)
    }
}

/// Buffer usage implied by creation flags.
pub fn derive_usage(flags: MemFlags) -> BufferUsage {
    let access = if flags.contains(MemFlags::READ_ONLY) {
        BufferUsage::UNIFORM_BUFFER
    } else {
        BufferUsage::STORAGE_BUFFER
    };
    BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST | access
}

/// Memory properties implied by creation flags.
pub fn derive_properties(flags: MemFlags, config: &MemConfig) -> MemoryProperties {
    if flags.intersects(MemFlags::HOST_PTR) {
        MemoryProperties::HOST_VISIBLE
    } else if config.device_local_buffers {
        MemoryProperties::DEVICE_LOCAL
    } else {
        MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT
    }
}

/// Which host operation is being checked against the host access flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HostAccess {
    Map,
    Read,
    Write,
}

/// The map-lock protected state. `ptr` is `Some` exactly when `count > 0`.
#[derive(Debug, Default)]
pub(crate) struct MapState {
    ptr: Option<NonNull<u8>>,
    count: u32,
    /// Set while the last unmap pushes host writes back; new maps wait for it.
    flushing: bool,
}

/// Outcome of dropping one map reference under the map lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapRelease {
    NotMapped,
    Shared,
    Last,
}

// SAFETY: the pointer is only an address into device-owned memory; it is never
// dereferenced through `MapState`.
unsafe impl Send for MapState {}

/// State shared by every memory object.
pub struct MemoryCore {
    device: Arc<dyn Device>,
    config: MemConfig,
    kind: MemObjectType,
    flags: MemFlags,
    usage: BufferUsage,
    properties: MemoryProperties,
    map: Mutex<MapState>,
    /// Serializes the 0 -> 1 and 1 -> 0 map transitions, including the staging
    /// transfers around them.
    transition: Mutex<()>,
}

impl std::fmt::Debug for MemoryCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCore")
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("usage", &self.usage)
            .field("properties", &self.properties)
            .field("map_count", &self.map_count())
            .finish()
    }
}

impl MemoryCore {
    pub(crate) fn new(
        device: Arc<dyn Device>,
        config: MemConfig,
        kind: MemObjectType,
        flags: MemFlags,
        properties: MemoryProperties,
    ) -> Self {
        Self {
            device,
            config,
            kind,
            flags,
            usage: derive_usage(flags),
            properties,
            map: Mutex::new(MapState::default()),
            transition: Mutex::new(()),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn config(&self) -> &MemConfig {
        &self.config
    }

    pub fn kind(&self) -> MemObjectType {
        self.kind
    }

    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn properties(&self) -> MemoryProperties {
        self.properties
    }

    pub fn map_count(&self) -> u32 {
        self.map.lock().count
    }

    pub(crate) fn lock_map(&self) -> MutexGuard<'_, MapState> {
        self.map.lock()
    }

    fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition.lock()
    }

    /// Hold off map transitions for a staging operation that needs the object unmapped.
    pub(crate) fn lock_unmapped(&self) -> MemResult<MutexGuard<'_, ()>> {
        let transition = self.transition.lock();
        if self.map_count() > 0 {
            return Err(MemError::InvalidState("object is mapped"));
        }
        Ok(transition)
    }

    /// Take another reference on a live mapping. `None` when unmapped or flushing.
    fn map_shared(&self) -> Option<NonNull<u8>> {
        let mut state = self.map.lock();
        match state.ptr {
            Some(ptr) if !state.flushing => {
                state.count += 1;
                Some(ptr)
            }
            _ => None,
        }
    }

    /// Drop one reference unless it is the last; the last one is left in place.
    fn release_shared(&self) -> MapRelease {
        let mut state = self.map.lock();
        match state.count {
            0 => MapRelease::NotMapped,
            1 => MapRelease::Last,
            _ => {
                state.count -= 1;
                MapRelease::Shared
            }
        }
    }

    pub(crate) fn check_host_access(&self, access: HostAccess) -> MemResult<()> {
        let denied = match access {
            HostAccess::Map => false,
            HostAccess::Read => self.flags.contains(MemFlags::HOST_WRITE_ONLY),
            HostAccess::Write => self.flags.contains(MemFlags::HOST_READ_ONLY),
        };
        if denied || self.flags.contains(MemFlags::HOST_NO_ACCESS) {
            return Err(MemError::InvalidState("host access is not allowed by the creation flags"));
        }
        Ok(())
    }
}

/// Capability set shared by buffers and images.
///
/// Implementors supply the device map step and the staging transfers around it; the
/// provided methods keep the map count and pointer consistent under the map lock.
pub trait MemoryObject: Send + Sync {
    fn core(&self) -> &MemoryCore;

    /// Size in bytes as seen by the host.
    fn size(&self) -> usize;

    /// Map the backing memory and return the address of byte 0. Called under the map
    /// lock when the count goes from 0 to 1.
    fn map_impl(&self) -> MemResult<NonNull<u8>>;

    /// Undo [`map_impl`](Self::map_impl). Called under the map lock on the last unmap.
    fn unmap_impl(&self);

    /// Bring host-visible memory up to date before the first map. Runs outside the map
    /// lock, before any map of the object can observe the pointer.
    fn prepare_map(&self) -> MemResult<()> {
        Ok(())
    }

    /// Push host writes back to the device on the last unmap. Runs outside the map
    /// lock while the mapping is still live; no new map can start until it returns.
    fn finish_unmap(&self) -> MemResult<()> {
        Ok(())
    }

    /// Whether pending device work references this object's resources. Never blocks.
    fn is_currently_in_use(&self) -> bool;

    /// Record a device copy of `size` bytes into another object of the same kind.
    fn copy_to_object(&self, dst: &Self, src_offset: usize, dst_offset: usize, size: usize) -> MemResult<Serial>
    where
        Self: Sized;

    /// Byte offset into the backing allocation (non-zero for sub-buffers).
    fn offset(&self) -> usize {
        0
    }

    fn kind(&self) -> MemObjectType {
        self.core().kind()
    }

    fn flags(&self) -> MemFlags {
        self.core().flags()
    }

    fn usage_flags(&self) -> BufferUsage {
        self.core().usage()
    }

    fn memory_property_flags(&self) -> MemoryProperties {
        self.core().properties()
    }

    fn is_writable(&self) -> bool {
        self.usage_flags()
            .contains(BufferUsage::TRANSFER_DST | BufferUsage::STORAGE_BUFFER)
    }

    fn map_count(&self) -> u32 {
        self.core().map_count()
    }

    fn is_mapped(&self) -> bool {
        self.map_count() > 0
    }

    /// Map the object and return a pointer to byte `offset`.
    ///
    /// Repeated maps return the same base address; each must be balanced by
    /// [`unmap`](Self::unmap). The first map runs [`prepare_map`](Self::prepare_map)
    /// and every other map waits until it has finished.
    fn map(&self, offset: usize) -> MemResult<NonNull<u8>> {
        let core = self.core();
        core.check_host_access(HostAccess::Map)?;
        if offset > self.size() {
            return Err(MemError::out_of_bounds(offset, 0, self.size()));
        }

        let base = match core.map_shared() {
            Some(base) => base,
            None => {
                let _transition = core.lock_transition();
                match core.map_shared() {
                    Some(base) => base,
                    None => {
                        // Nothing is recorded until the mapping exists, so a failure
                        // here leaves the object unmapped.
                        self.prepare_map()?;
                        let mut state = core.lock_map();
                        let ptr = self.map_impl()?;
                        state.ptr = Some(ptr);
                        state.count = 1;
                        ptr
                    }
                }
            }
        };
        // SAFETY: offset <= size, and the mapping covers the whole object.
        Ok(unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) })
    }

    /// Release one map. Unmapping an unmapped object is a no-op.
    ///
    /// The last unmap runs [`finish_unmap`](Self::finish_unmap) while the mapping is
    /// still live. If it fails the object stays mapped with a count of one, so the
    /// host writes are kept and the unmap can be retried.
    fn unmap(&self) -> MemResult<()> {
        let core = self.core();
        match core.release_shared() {
            MapRelease::NotMapped => {
                crate::dm_emit!(DM001);
                return Ok(());
            }
            MapRelease::Shared => return Ok(()),
            MapRelease::Last => {}
        }

        let _transition = core.lock_transition();
        // Another thread may have mapped or unmapped while we waited.
        match core.release_shared() {
            MapRelease::NotMapped => {
                crate::dm_emit!(DM001);
                return Ok(());
            }
            MapRelease::Shared => return Ok(()),
            MapRelease::Last => core.lock_map().flushing = true,
        }

        let flushed = self.finish_unmap();
        let mut state = core.lock_map();
        state.flushing = false;
        flushed?;
        self.unmap_impl();
        state.ptr = None;
        state.count = 0;
        Ok(())
    }

    /// Copy `dst.len()` bytes starting at `offset` out of the object.
    fn copy_to(&self, dst: &mut [u8], offset: usize) -> MemResult<()> {
        self.core().check_host_access(HostAccess::Read)?;
        check_range(offset, dst.len(), self.size())?;
        let ptr = self.map(offset)?;
        // SAFETY: the range was checked against the mapped size.
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), dst.as_mut_ptr(), dst.len());
        }
        self.unmap()
    }

    /// Copy `src` into the object starting at `offset`.
    fn copy_from(&self, src: &[u8], offset: usize) -> MemResult<()> {
        self.core().check_host_access(HostAccess::Write)?;
        check_range(offset, src.len(), self.size())?;
        let ptr = self.map(offset)?;
        // SAFETY: the range was checked against the mapped size.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), ptr.as_ptr(), src.len());
        }
        self.unmap()
    }

    /// Create a view over `[offset, offset + size)` sharing this object's storage.
    fn create_sub_buffer(&self, flags: MemFlags, offset: usize, size: usize) -> MemResult<BufferObject>;
}
