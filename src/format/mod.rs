//! Image formats.
//!
//! An [`ImageFormat`] pairs a channel order (which components are stored, and in what
//! memory order) with a channel data type (how each component is encoded). The element
//! size of every image follows from it.

pub mod pixel;

pub use pixel::{fill_region, pack_pixels, unpack_pixel, FillColor, PixelBytes, PixelColor};

use crate::error::{MemError, MemResult};

/// A color component as it appears in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Component {
    R,
    G,
    B,
    A,
    /// Single stored value read back as (I, I, I, I)
    Intensity,
    /// Single stored value read back as (L, L, L, 1)
    Luminance,
}

impl Component {
    /// Lane of the canonical 4-channel color this component is taken from.
    pub const fn lane(self) -> usize {
        match self {
            Component::R | Component::Intensity | Component::Luminance => 0,
            Component::G => 1,
            Component::B => 2,
            Component::A => 3,
        }
    }
}

/// Which components an image stores, in memory order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelOrder {
    R,
    A,
    Rg,
    Ra,
    Rgb,
    Rgba,
    Bgra,
    Argb,
    Intensity,
    Luminance,
}

impl ChannelOrder {
    /// Stored components in memory order.
    pub const fn components(self) -> &'static [Component] {
        use Component::*;
        match self {
            ChannelOrder::R => &[R],
            ChannelOrder::A => &[A],
            ChannelOrder::Rg => &[R, G],
            ChannelOrder::Ra => &[R, A],
            ChannelOrder::Rgb => &[R, G, B],
            ChannelOrder::Rgba => &[R, G, B, A],
            ChannelOrder::Bgra => &[B, G, R, A],
            ChannelOrder::Argb => &[A, R, G, B],
            ChannelOrder::Intensity => &[Intensity],
            ChannelOrder::Luminance => &[Luminance],
        }
    }

    /// Number of stored channels.
    pub const fn channel_count(self) -> usize {
        self.components().len()
    }
}

/// How a fill color must be supplied for a data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelClass {
    /// Normalized and floating types take `FillColor::Float`
    Float,
    /// Signed integer types take `FillColor::Int`
    SignedInt,
    /// Unsigned integer types take `FillColor::Uint`
    UnsignedInt,
}

/// Per-channel encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    SnormInt8,
    SnormInt16,
    UnormInt8,
    UnormInt16,
    UnormShort565,
    UnormShort555,
    UnormInt101010,
    SignedInt8,
    SignedInt16,
    SignedInt32,
    UnsignedInt8,
    UnsignedInt16,
    UnsignedInt32,
    HalfFloat,
    Float,
}

impl ChannelType {
    /// Bytes per channel, or `None` for packed types that share one word across channels.
    pub const fn channel_size(self) -> Option<usize> {
        match self {
            ChannelType::SnormInt8 | ChannelType::UnormInt8 | ChannelType::SignedInt8 | ChannelType::UnsignedInt8 => Some(1),
            ChannelType::SnormInt16
            | ChannelType::UnormInt16
            | ChannelType::SignedInt16
            | ChannelType::UnsignedInt16
            | ChannelType::HalfFloat => Some(2),
            ChannelType::SignedInt32 | ChannelType::UnsignedInt32 | ChannelType::Float => Some(4),
            ChannelType::UnormShort565 | ChannelType::UnormShort555 | ChannelType::UnormInt101010 => None,
        }
    }

    /// Whether all channels share one packed word.
    pub const fn is_packed(self) -> bool {
        self.channel_size().is_none()
    }

    pub const fn class(self) -> ChannelClass {
        match self {
            ChannelType::SignedInt8 | ChannelType::SignedInt16 | ChannelType::SignedInt32 => ChannelClass::SignedInt,
            ChannelType::UnsignedInt8 | ChannelType::UnsignedInt16 | ChannelType::UnsignedInt32 => ChannelClass::UnsignedInt,
            _ => ChannelClass::Float,
        }
    }
}

/// Channel order plus channel data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageFormat {
    pub order: ChannelOrder,
    pub data_type: ChannelType,
}

impl ImageFormat {
    pub const fn new(order: ChannelOrder, data_type: ChannelType) -> Self {
        Self { order, data_type }
    }

    fn unsupported(&self) -> MemError {
        MemError::UnsupportedFormat {
            order: self.order,
            data_type: self.data_type,
        }
    }

    /// Check that the order/type combination describes a real pixel layout.
    pub fn validate(&self) -> MemResult<()> {
        let packed = self.data_type.is_packed();
        match self.order {
            // Three-channel layouts only exist as packed words.
            ChannelOrder::Rgb if !packed => Err(self.unsupported()),
            ChannelOrder::Rgb => Ok(()),
            _ if packed => Err(self.unsupported()),
            ChannelOrder::Intensity | ChannelOrder::Luminance
                if self.data_type.class() != ChannelClass::Float =>
            {
                Err(self.unsupported())
            }
            _ => Ok(()),
        }
    }

    pub const fn channel_count(&self) -> usize {
        self.order.channel_count()
    }

    /// Bytes per pixel.
    pub fn element_size(&self) -> MemResult<usize> {
        self.validate()?;
        Ok(match self.data_type {
            ChannelType::UnormShort565 | ChannelType::UnormShort555 => 2,
            ChannelType::UnormInt101010 => 4,
            other => other.channel_size().unwrap_or(0) * self.channel_count(),
        })
    }
}

/// Byte layout of a pitched image region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitchLayout {
    pub element_size: usize,
    pub row_pitch: usize,
    /// Zero for layouts with a single slice
    pub slice_pitch: usize,
}

impl PitchLayout {
    /// Byte offset of texel (x, y, z).
    pub const fn offset_of(&self, origin: [usize; 3]) -> usize {
        origin[2] * self.slice_pitch + origin[1] * self.row_pitch + origin[0] * self.element_size
    }

    /// Byte offset of texel (x, y, z), or `None` if it does not fit in `usize`.
    pub fn checked_offset_of(&self, origin: [usize; 3]) -> Option<usize> {
        origin[2]
            .checked_mul(self.slice_pitch)?
            .checked_add(origin[1].checked_mul(self.row_pitch)?)?
            .checked_add(origin[0].checked_mul(self.element_size)?)
    }

    /// Bytes spanned by a region starting at the layout's origin.
    pub fn span(&self, region: [usize; 3]) -> Option<usize> {
        crate::util::layout::pitched_span(
            region[0].checked_mul(self.element_size)?,
            region[1],
            region[2],
            self.row_pitch,
            self.slice_pitch,
        )
    }
}
