//! Pixel packing, decoding and region fills.
//!
//! Fill colors arrive as four canonical lanes (R, G, B, A). Packing picks, for every
//! component the format stores, the lane that component names, and encodes it with the
//! format's channel type. Lanes the format does not store are dropped; on decode they
//! come back as 0 for R/G/B and 1 for A, intensity is replicated to all four lanes and
//! luminance to R/G/B.

use half::f16;

use super::{ChannelClass, ChannelType, Component, ImageFormat, PitchLayout};
use crate::error::{MemError, MemResult};

/// Canonical 4-channel color supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillColor {
    /// For normalized, half and float formats
    Float([f32; 4]),
    /// For signed integer formats
    Int([i32; 4]),
    /// For unsigned integer formats
    Uint([u32; 4]),
}

impl FillColor {
    fn class(&self) -> ChannelClass {
        match self {
            FillColor::Float(_) => ChannelClass::Float,
            FillColor::Int(_) => ChannelClass::SignedInt,
            FillColor::Uint(_) => ChannelClass::UnsignedInt,
        }
    }
}

/// One packed pixel in its format's native representation, channels in memory order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PixelColor {
    U8([u8; 4]),
    I8([i8; 4]),
    U16([u16; 4]),
    I16([i16; 4]),
    U32([u32; 4]),
    I32([i32; 4]),
    F16([f16; 4]),
    F32([f32; 4]),
}

/// Raw bytes of one pixel, ready to be replicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelBytes {
    bytes: [u8; 16],
    len: usize,
}

impl PixelBytes {
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

macro_rules! encode_lanes {
    ($lanes:expr, $channels:expr, $out:ident, $len:ident) => {{
        for lane in $lanes.iter().take($channels) {
            let raw = lane.to_ne_bytes();
            $out[$len..$len + raw.len()].copy_from_slice(&raw);
            $len += raw.len();
        }
    }};
}

macro_rules! decode_lanes {
    ($ty:ty, $bytes:expr, $channels:expr) => {{
        const WIDTH: usize = std::mem::size_of::<$ty>();
        let mut lanes = [<$ty>::default(); 4];
        for (i, lane) in lanes.iter_mut().enumerate().take($channels) {
            let mut raw = [0u8; WIDTH];
            raw.copy_from_slice(&$bytes[i * WIDTH..(i + 1) * WIDTH]);
            *lane = <$ty>::from_ne_bytes(raw);
        }
        lanes
    }};
}

impl PixelColor {
    /// Native-endian bytes of the first `channels` lanes.
    pub fn encode(&self, channels: usize) -> PixelBytes {
        let channels = channels.min(4);
        let mut bytes = [0u8; 16];
        let mut len = 0;
        match self {
            PixelColor::U8(v) => encode_lanes!(v, channels, bytes, len),
            PixelColor::I8(v) => encode_lanes!(v, channels, bytes, len),
            PixelColor::U16(v) => encode_lanes!(v, channels, bytes, len),
            PixelColor::I16(v) => encode_lanes!(v, channels, bytes, len),
            PixelColor::U32(v) => encode_lanes!(v, channels, bytes, len),
            PixelColor::I32(v) => encode_lanes!(v, channels, bytes, len),
            PixelColor::F16(v) => encode_lanes!(v, channels, bytes, len),
            PixelColor::F32(v) => encode_lanes!(v, channels, bytes, len),
        }
        PixelBytes { bytes, len }
    }

    /// Read one pixel of `format` from `bytes`.
    pub fn decode(format: &ImageFormat, bytes: &[u8]) -> MemResult<PixelColor> {
        let element_size = format.element_size()?;
        if bytes.len() < element_size {
            return Err(MemError::out_of_bounds(0, element_size, bytes.len()));
        }
        let n = format.channel_count();
        Ok(match format.data_type {
            ChannelType::UnormInt8 | ChannelType::UnsignedInt8 => PixelColor::U8(decode_lanes!(u8, bytes, n)),
            ChannelType::SnormInt8 | ChannelType::SignedInt8 => PixelColor::I8(decode_lanes!(i8, bytes, n)),
            ChannelType::UnormInt16 | ChannelType::UnsignedInt16 => PixelColor::U16(decode_lanes!(u16, bytes, n)),
            ChannelType::SnormInt16 | ChannelType::SignedInt16 => PixelColor::I16(decode_lanes!(i16, bytes, n)),
            ChannelType::UnsignedInt32 => PixelColor::U32(decode_lanes!(u32, bytes, n)),
            ChannelType::SignedInt32 => PixelColor::I32(decode_lanes!(i32, bytes, n)),
            ChannelType::HalfFloat => PixelColor::F16(decode_lanes!(f16, bytes, n)),
            ChannelType::Float => PixelColor::F32(decode_lanes!(f32, bytes, n)),
            ChannelType::UnormShort565 | ChannelType::UnormShort555 | ChannelType::UnormInt101010 => {
                return Err(MemError::UnsupportedFormat {
                    order: format.order,
                    data_type: format.data_type,
                })
            }
        })
    }
}

fn unorm(value: f32, max: f32) -> f32 {
    (value.clamp(0.0, 1.0) * max).round()
}

fn snorm(value: f32, max: f32) -> f32 {
    (value.clamp(-1.0, 1.0) * max).round()
}

/// Convert a canonical fill color into `format`'s native per-channel representation.
pub fn pack_pixels(format: &ImageFormat, color: &FillColor) -> MemResult<PixelColor> {
    format.validate()?;
    let unsupported = MemError::UnsupportedFormat {
        order: format.order,
        data_type: format.data_type,
    };
    if format.data_type.is_packed() || color.class() != format.data_type.class() {
        return Err(unsupported);
    }

    let components = format.order.components();
    let lanes = |i: usize| components[i].lane();

    macro_rules! pack {
        ($variant:ident, $ty:ty, $src:expr, $convert:expr) => {{
            let mut out = [<$ty>::default(); 4];
            for (i, slot) in out.iter_mut().enumerate().take(components.len()) {
                *slot = $convert($src[lanes(i)]);
            }
            PixelColor::$variant(out)
        }};
    }

    Ok(match (format.data_type, color) {
        (ChannelType::UnormInt8, FillColor::Float(v)) => pack!(U8, u8, v, |x| unorm(x, 255.0) as u8),
        (ChannelType::UnormInt16, FillColor::Float(v)) => pack!(U16, u16, v, |x| unorm(x, 65535.0) as u16),
        (ChannelType::SnormInt8, FillColor::Float(v)) => pack!(I8, i8, v, |x| snorm(x, 127.0) as i8),
        (ChannelType::SnormInt16, FillColor::Float(v)) => pack!(I16, i16, v, |x| snorm(x, 32767.0) as i16),
        (ChannelType::HalfFloat, FillColor::Float(v)) => pack!(F16, f16, v, f16::from_f32),
        (ChannelType::Float, FillColor::Float(v)) => pack!(F32, f32, v, |x| x),
        (ChannelType::SignedInt8, FillColor::Int(v)) => pack!(I8, i8, v, |x: i32| x.clamp(-128, 127) as i8),
        (ChannelType::SignedInt16, FillColor::Int(v)) => pack!(I16, i16, v, |x: i32| x.clamp(-32768, 32767) as i16),
        (ChannelType::SignedInt32, FillColor::Int(v)) => pack!(I32, i32, v, |x| x),
        (ChannelType::UnsignedInt8, FillColor::Uint(v)) => pack!(U8, u8, v, |x: u32| x.min(255) as u8),
        (ChannelType::UnsignedInt16, FillColor::Uint(v)) => pack!(U16, u16, v, |x: u32| x.min(65535) as u16),
        (ChannelType::UnsignedInt32, FillColor::Uint(v)) => pack!(U32, u32, v, |x| x),
        _ => return Err(unsupported),
    })
}

/// Spread stored values back over four canonical lanes, applying the absent-channel
/// defaults and intensity/luminance replication.
fn spread<T: Copy>(components: &[Component], stored: &[T; 4], zero: T, one: T) -> [T; 4] {
    let mut out = [zero, zero, zero, one];
    for (i, component) in components.iter().enumerate() {
        let value = stored[i];
        match component {
            Component::Intensity => out = [value; 4],
            Component::Luminance => {
                out[0] = value;
                out[1] = value;
                out[2] = value;
            }
            other => out[other.lane()] = value,
        }
    }
    out
}

/// Decode a packed pixel back into a canonical 4-channel color.
pub fn unpack_pixel(format: &ImageFormat, pixel: &PixelColor) -> MemResult<FillColor> {
    format.validate()?;
    let components = format.order.components();
    let mismatch = MemError::InvalidValue("pixel representation does not match the image format");

    let floats = |values: [f32; 4]| FillColor::Float(spread(components, &values, 0.0, 1.0));
    Ok(match (format.data_type, pixel) {
        (ChannelType::UnormInt8, PixelColor::U8(v)) => floats(v.map(|x| x as f32 / 255.0)),
        (ChannelType::UnormInt16, PixelColor::U16(v)) => floats(v.map(|x| x as f32 / 65535.0)),
        (ChannelType::SnormInt8, PixelColor::I8(v)) => floats(v.map(|x| (x as f32 / 127.0).max(-1.0))),
        (ChannelType::SnormInt16, PixelColor::I16(v)) => floats(v.map(|x| (x as f32 / 32767.0).max(-1.0))),
        (ChannelType::HalfFloat, PixelColor::F16(v)) => floats(v.map(f16::to_f32)),
        (ChannelType::Float, PixelColor::F32(v)) => floats(*v),
        (ChannelType::SignedInt8, PixelColor::I8(v)) => FillColor::Int(spread(components, &v.map(i32::from), 0, 1)),
        (ChannelType::SignedInt16, PixelColor::I16(v)) => FillColor::Int(spread(components, &v.map(i32::from), 0, 1)),
        (ChannelType::SignedInt32, PixelColor::I32(v)) => FillColor::Int(spread(components, v, 0, 1)),
        (ChannelType::UnsignedInt8, PixelColor::U8(v)) => FillColor::Uint(spread(components, &v.map(u32::from), 0, 1)),
        (ChannelType::UnsignedInt16, PixelColor::U16(v)) => FillColor::Uint(spread(components, &v.map(u32::from), 0, 1)),
        (ChannelType::UnsignedInt32, PixelColor::U32(v)) => FillColor::Uint(spread(components, v, 0, 1)),
        (ChannelType::UnormShort565 | ChannelType::UnormShort555 | ChannelType::UnormInt101010, _) => {
            return Err(MemError::UnsupportedFormat {
                order: format.order,
                data_type: format.data_type,
            })
        }
        _ => return Err(mismatch),
    })
}

/// Replicate `pixel` over `region` starting at `origin` inside `dst`, whose layout is
/// `layout`. Bytes outside the region are never touched.
pub fn fill_region(
    dst: &mut [u8],
    layout: &PitchLayout,
    origin: [usize; 3],
    region: [usize; 3],
    pixel: &[u8],
) -> MemResult<()> {
    let e = layout.element_size;
    if pixel.len() != e {
        return Err(MemError::InvalidValue("pixel size does not match the element size"));
    }
    if region.contains(&0) {
        return Ok(());
    }
    let overflow = MemError::InvalidValue("fill region overflows");
    let row_offset = origin[0].checked_mul(e).ok_or(overflow.clone())?;
    let row_bytes = region[0].checked_mul(e).ok_or(overflow.clone())?;
    crate::error::check_range(row_offset, row_bytes, layout.row_pitch)?;
    let start = layout.checked_offset_of(origin).ok_or(overflow.clone())?;
    crate::error::check_range(start, layout.span(region).ok_or(overflow)?, dst.len())?;

    for z in 0..region[2] {
        for y in 0..region[1] {
            let row_start = start + z * layout.slice_pitch + y * layout.row_pitch;
            for texel in dst[row_start..row_start + row_bytes].chunks_exact_mut(e) {
                texel.copy_from_slice(pixel);
            }
        }
    }
    Ok(())
}
