//! Error taxonomy for memory-object operations.
//!
//! Every failure is reported synchronously and before any state is mutated.
//! [`MemError::status`] maps the taxonomy one-to-one onto host API error codes.

use thiserror::Error;

use crate::format::{ChannelOrder, ChannelType};
use crate::gpu::DeviceError;

/// Result alias used throughout the crate.
pub type MemResult<T> = Result<T, MemError>;

/// Errors returned by memory-object operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MemError {
    /// Requested offset/size/region exceeds the object's extent.
    #[error("range {offset}..{offset}+{size} exceeds the {limit}-byte object")]
    OutOfBounds {
        offset: usize,
        size: usize,
        limit: usize,
    },

    /// A parameter is malformed independently of any bounds (zero size, bad pattern).
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    /// Device allocation, mapping or staging growth failed.
    #[error("out of resources: {0}")]
    OutOfResources(#[from] DeviceError),

    /// The object is in a state that forbids the operation.
    #[error("invalid memory object state: {0}")]
    InvalidState(&'static str),

    /// A handle refers to an object that was released.
    #[error("stale or unknown memory object handle")]
    InvalidHandle,

    /// The pixel format/channel combination is not supported by the codec.
    #[error("unsupported image format {order:?}/{data_type:?}")]
    UnsupportedFormat {
        order: ChannelOrder,
        data_type: ChannelType,
    },
}

impl MemError {
    /// Shorthand for a bounds violation.
    pub(crate) fn out_of_bounds(offset: usize, size: usize, limit: usize) -> Self {
        MemError::OutOfBounds { offset, size, limit }
    }

    /// The host API status code for this error.
    pub fn status(&self) -> ErrorCode {
        match self {
            MemError::OutOfBounds { .. } | MemError::InvalidValue(_) => ErrorCode::InvalidValue,
            MemError::OutOfResources(_) => ErrorCode::OutOfResources,
            MemError::InvalidState(_) | MemError::InvalidHandle => ErrorCode::InvalidMemObject,
            MemError::UnsupportedFormat { .. } => ErrorCode::ImageFormatNotSupported,
        }
    }
}

/// Host API status codes (OpenCL numbering).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidValue,
    OutOfResources,
    InvalidMemObject,
    ImageFormatNotSupported,
}

impl ErrorCode {
    /// The raw status value as the host API reports it.
    pub const fn as_raw(self) -> i32 {
        match self {
            ErrorCode::OutOfResources => -5,
            ErrorCode::ImageFormatNotSupported => -10,
            ErrorCode::InvalidValue => -30,
            ErrorCode::InvalidMemObject => -38,
        }
    }
}

/// Check that `[offset, offset + size)` lies within `limit` bytes.
pub(crate) fn check_range(offset: usize, size: usize, limit: usize) -> MemResult<()> {
    match offset.checked_add(size) {
        Some(end) if end <= limit => Ok(()),
        _ => Err(MemError::out_of_bounds(offset, size, limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(MemError::out_of_bounds(900, 200, 1024).status(), ErrorCode::InvalidValue);
        assert_eq!(
            MemError::from(DeviceError::OutOfDeviceMemory { requested: 1, available: 0 }).status(),
            ErrorCode::OutOfResources
        );
        assert_eq!(MemError::InvalidState("mapped").status(), ErrorCode::InvalidMemObject);
        assert_eq!(
            MemError::UnsupportedFormat {
                order: ChannelOrder::Rgb,
                data_type: ChannelType::UnormShort565,
            }
            .status()
            .as_raw(),
            -10
        );
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(256, 256, 1024).is_ok());
        assert!(check_range(1024, 0, 1024).is_ok());
        assert!(check_range(900, 200, 1024).is_err());
        assert!(check_range(usize::MAX, 2, 1024).is_err());
    }
}
