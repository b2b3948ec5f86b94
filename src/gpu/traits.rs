//! Device traits and types
//!
//! This module defines the device interface WITHOUT pulling in any backend-specific dependencies.
//! Memory objects depend on these traits, not on an implementation: allocation, mapping,
//! command submission and the in-flight query all live behind [`Device`].

use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use thiserror::Error;

/// Errors reported by a device backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Out of device memory
    #[error("device out of memory: requested {requested} bytes, {available} available")]
    OutOfDeviceMemory { requested: usize, available: usize },
    /// Allocation exceeds the per-allocation limit
    #[error("allocation of {requested} bytes exceeds the device limit of {limit}")]
    AllocationTooLarge { requested: usize, limit: usize },
    /// The allocation is not host-visible and cannot be mapped
    #[error("allocation {0} is not host-visible")]
    NotHostVisible(AllocationId),
    /// The allocation was never created or has been freed
    #[error("unknown allocation {0}")]
    UnknownAllocation(AllocationId),
    /// A recorded command addressed memory outside its allocations
    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),
    /// The requested size does not fit in the address space
    #[error("allocation size overflows the address space")]
    SizeOverflow,
}

bitflags! {
    /// Allowed usages of a buffer allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 0x0001;
        const TRANSFER_DST = 0x0002;
        const UNIFORM_TEXEL_BUFFER = 0x0004;
        const STORAGE_TEXEL_BUFFER = 0x0008;
        const UNIFORM_BUFFER = 0x0010;
        const STORAGE_BUFFER = 0x0020;
    }

    /// Allowed usages of an image allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 0x0001;
        const TRANSFER_DST = 0x0002;
        const SAMPLED = 0x0004;
        const STORAGE = 0x0008;
    }

    /// Memory locality of an allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        /// Fastest for device access, not mappable
        const DEVICE_LOCAL = 0x0001;
        /// Host can map the allocation
        const HOST_VISIBLE = 0x0002;
        /// Host writes are visible without explicit flushes
        const HOST_COHERENT = 0x0004;
        /// Host reads are cached
        const HOST_CACHED = 0x0008;
    }
}

/// Opaque identifier of a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId(pub u64);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Position of a submitted command in the device's completion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Serial(pub u64);

impl Serial {
    /// Serial that is complete before anything was submitted.
    pub const ZERO: Serial = Serial(0);
}

/// Last serial that referenced an allocation.
///
/// Shared between every handle to the allocation; the device bumps it on submit and the
/// in-use query compares it against the completed serial without taking any lock.
#[derive(Debug, Default)]
pub struct ResourceUse {
    serial: AtomicU64,
}

impl ResourceUse {
    /// A resource that no command has referenced yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recent serial that used this resource.
    pub fn serial(&self) -> Serial {
        Serial(self.serial.load(Ordering::Acquire))
    }

    /// Record a use at `serial`. Serials never move backwards.
    pub fn record(&self, serial: Serial) {
        self.serial.fetch_max(serial.0, Ordering::AcqRel);
    }
}

/// Dimensionality of a device image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageType {
    D1,
    D2,
    D3,
}

/// Size of an image region in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent3D {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent3D {
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self { width, height, depth }
    }

    /// Number of texels covered, or `None` if it does not fit in `usize`.
    pub fn texel_count(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.depth as usize)
    }
}

/// Position of an image region in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Offset3D {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl Offset3D {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }
}

/// Array layers touched by an image copy. Color aspect, mip level 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageSubresourceLayers {
    pub base_array_layer: u32,
    pub layer_count: u32,
}

/// Everything a backend needs to lay out an image allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageAllocationInfo {
    pub image_type: ImageType,
    pub extent: Extent3D,
    pub array_layers: u32,
    pub element_size: usize,
    pub usage: ImageUsage,
}

impl ImageAllocationInfo {
    /// Bytes needed for a tightly packed copy of every layer, or `None` on overflow.
    pub fn packed_size(&self) -> Option<usize> {
        self.extent
            .texel_count()?
            .checked_mul(self.array_layers as usize)?
            .checked_mul(self.element_size)
    }
}

/// What kind of resource an allocation backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Buffer { usage: BufferUsage },
    Image(ImageAllocationInfo),
}

/// Allocation parameters handed to [`Device::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    /// Size in bytes
    pub size: usize,
    /// Requested memory locality
    pub properties: MemoryProperties,
    /// Buffer or image layout
    pub kind: ResourceKind,
}

impl AllocationRequest {
    /// Request a linear buffer.
    pub fn buffer(size: usize, usage: BufferUsage, properties: MemoryProperties) -> Self {
        Self {
            size,
            properties,
            kind: ResourceKind::Buffer { usage },
        }
    }

    /// Request an image with an opaque device layout.
    pub fn image(info: ImageAllocationInfo, properties: MemoryProperties) -> Result<Self, DeviceError> {
        let size = info.packed_size().ok_or(DeviceError::SizeOverflow)?;
        Ok(Self {
            size,
            properties,
            kind: ResourceKind::Image(info),
        })
    }
}

/// A live device allocation.
///
/// Cloning is cheap and shares the [`ResourceUse`]; ownership of the memory itself stays
/// with whoever calls [`Device::free`].
#[derive(Debug, Clone)]
pub struct DeviceAllocation {
    id: AllocationId,
    size: usize,
    properties: MemoryProperties,
    resource_use: Arc<ResourceUse>,
}

impl DeviceAllocation {
    /// Create an allocation record. Called by backends.
    pub fn new(id: AllocationId, size: usize, properties: MemoryProperties) -> Self {
        Self {
            id,
            size,
            properties,
            resource_use: Arc::new(ResourceUse::new()),
        }
    }

    pub fn id(&self) -> AllocationId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn properties(&self) -> MemoryProperties {
        self.properties
    }

    /// Whether the host can map this allocation directly.
    pub fn is_host_visible(&self) -> bool {
        self.properties.contains(MemoryProperties::HOST_VISIBLE)
    }

    pub fn resource_use(&self) -> &ResourceUse {
        &self.resource_use
    }
}

/// Buffer⇄image copy region, Vulkan-style: row length and image height are in texels,
/// zero meaning tightly packed to the image extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: usize,
    pub buffer_row_length: u32,
    pub buffer_image_height: u32,
    pub subresource: ImageSubresourceLayers,
    pub image_offset: Offset3D,
    pub image_extent: Extent3D,
}

/// Image→image copy region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCopy {
    pub src_subresource: ImageSubresourceLayers,
    pub src_offset: Offset3D,
    pub dst_subresource: ImageSubresourceLayers,
    pub dst_offset: Offset3D,
    pub extent: Extent3D,
}

/// A unit of device work produced by memory objects.
#[derive(Debug, Clone)]
pub enum DeviceCommand {
    CopyBuffer {
        src: DeviceAllocation,
        dst: DeviceAllocation,
        src_offset: usize,
        dst_offset: usize,
        size: usize,
    },
    FillBuffer {
        dst: DeviceAllocation,
        offset: usize,
        size: usize,
        pattern: Vec<u8>,
    },
    CopyBufferToImage {
        src: DeviceAllocation,
        dst: DeviceAllocation,
        region: BufferImageCopy,
    },
    CopyImageToBuffer {
        src: DeviceAllocation,
        dst: DeviceAllocation,
        region: BufferImageCopy,
    },
    CopyImage {
        src: DeviceAllocation,
        dst: DeviceAllocation,
        region: ImageCopy,
    },
}

impl DeviceCommand {
    /// Allocations read or written by this command.
    pub fn allocations(&self) -> Vec<&DeviceAllocation> {
        match self {
            DeviceCommand::FillBuffer { dst, .. } => vec![dst],
            DeviceCommand::CopyBuffer { src, dst, .. }
            | DeviceCommand::CopyBufferToImage { src, dst, .. }
            | DeviceCommand::CopyImageToBuffer { src, dst, .. }
            | DeviceCommand::CopyImage { src, dst, .. } => vec![src, dst],
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::CopyBuffer { .. } => "copy_buffer",
            DeviceCommand::FillBuffer { .. } => "fill_buffer",
            DeviceCommand::CopyBufferToImage { .. } => "copy_buffer_to_image",
            DeviceCommand::CopyImageToBuffer { .. } => "copy_image_to_buffer",
            DeviceCommand::CopyImage { .. } => "copy_image",
        }
    }
}

/// Static properties of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLimits {
    /// Largest single allocation in bytes
    pub max_allocation_size: usize,
    /// Enabled device extensions
    pub extensions: Vec<&'static str>,
}

impl DeviceLimits {
    /// Whether `name` is among the enabled extensions.
    pub fn has_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| *ext == name)
    }
}

/// The execution layer as seen by memory objects.
///
/// This trait is object-safe for use with `Arc<dyn Device>`.
pub trait Device: Send + Sync + fmt::Debug {
    /// Allocate memory for a buffer or image.
    fn allocate(&self, request: &AllocationRequest) -> Result<DeviceAllocation, DeviceError>;

    /// Release an allocation. Backends defer the release while commands still use it.
    fn free(&self, allocation: &DeviceAllocation);

    /// Map a host-visible allocation, returning a pointer to its first byte.
    ///
    /// The pointer stays valid until the matching [`Device::unmap`] call.
    fn map(&self, allocation: &DeviceAllocation) -> Result<NonNull<u8>, DeviceError>;

    /// Undo one [`Device::map`] call.
    fn unmap(&self, allocation: &DeviceAllocation);

    /// Record a command. The returned serial identifies its completion.
    fn submit(&self, command: DeviceCommand) -> Result<Serial, DeviceError>;

    /// Block until `serial` has completed.
    fn wait(&self, serial: Serial) -> Result<(), DeviceError>;

    /// Non-blocking: true once every command that used the resource has completed.
    fn has_resource_use_finished(&self, resource_use: &ResourceUse) -> bool;

    /// Device limits and extensions.
    fn limits(&self) -> &DeviceLimits;
}
