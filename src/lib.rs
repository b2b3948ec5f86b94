//! # devmem
//!
//! Device memory objects for compute runtimes.
//!
//! ## Features
//!
//! - Linear buffers and sub-buffer views sharing one device allocation
//! - 1D/2D/3D and array images with row/slice pitch bookkeeping
//! - Lazily allocated, grow-only staging buffers for host transfers
//! - Reference-counted map/unmap with a stable mapped pointer
//! - Pixel packing for image fills and readback
//! - Generational handles with parent links for sub-buffers
//! - Diagnostics for map/release misuse (`DM0xx`..`DM3xx`)
//!
//! Objects talk to the execution layer only through [`gpu::Device`]. [`gpu::HostDevice`]
//! is a RAM-backed implementation that records commands and runs them on `finish`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use devmem::{HostDevice, MemConfig, MemFlags, MemoryContext, MemoryObject};
//!
//! let device = Arc::new(HostDevice::new());
//! let ctx = MemoryContext::new(device, MemConfig::default());
//!
//! let handle = ctx.create_buffer(MemFlags::READ_WRITE, 1024, None)?;
//! let buffer = ctx.buffer(handle)?;
//! buffer.copy_from(&[1, 2, 3, 4], 0)?;
//!
//! let mut out = [0u8; 4];
//! buffer.copy_to(&mut out, 0)?;
//! assert_eq!(out, [1, 2, 3, 4]);
//! # Ok::<(), devmem::MemError>(())
//! ```

pub mod diagnostics;

pub mod api;
pub mod error;
pub mod format;
pub mod gpu;
pub mod memory;

mod sync;
mod util;

pub use api::config::MemConfig;
pub use api::context::{ContextStats, MemoryContext};
pub use api::handles::{Arena, BufferHandle, Handle, ImageHandle};

pub use error::{ErrorCode, MemError, MemResult};

pub use format::{
    ChannelClass, ChannelOrder, ChannelType, Component, FillColor, ImageFormat, PitchLayout, PixelColor,
};

pub use gpu::{Device, DeviceAllocation, DeviceCommand, DeviceError, HostDevice, MemoryProperties, Serial};

pub use memory::{
    BufferCreateInfo, BufferObject, ImageCopyWith, ImageDescriptor, ImageObject, MemFlags, MemObjectType,
    MemoryObject, StagingBuffer, StagingCopy,
};

// Diagnostics
pub use diagnostics::{suppress_diagnostics, Diagnostic, DiagnosticKind};
pub use diagnostics::{DM001, DM002, DM101, DM102, DM201, DM301, DM302, DM303};
