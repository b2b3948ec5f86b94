//! Device interface
//!
//! Memory objects talk to the execution layer only through the [`Device`] trait:
//! allocation, map/unmap, command submission and the in-flight query.
//!
//! ## Backends
//! - `host`: RAM-backed reference device, always available, used by the tests

// Always present for API stability: traits define the interface
pub mod traits;
pub use traits::{
    AllocationId, AllocationRequest, BufferImageCopy, BufferUsage, Device, DeviceAllocation,
    DeviceCommand, DeviceError, DeviceLimits, Extent3D, ImageAllocationInfo, ImageCopy,
    ImageSubresourceLayers, ImageType, ImageUsage, MemoryProperties, Offset3D, ResourceKind,
    ResourceUse, Serial,
};

pub mod host;
pub use host::{HostDevice, HostDeviceStats, EXTERNAL_MEMORY_HOST};
