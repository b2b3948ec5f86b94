//! Device images.
//!
//! Every host-side access to an image goes through its staging buffer, which holds the
//! whole image in the native layout: texel `(x, y, z)` in host coordinates lives at
//! `z * slice_pitch + y * row_pitch + x * element_size`. Host coordinates put the array
//! layer of a 1D array in `y` and the layer of a 2D array in `z`.
//!
//! Transfers between staging and the device image are recorded as full-image copies:
//! [`ImageObject::readback`] before host reads, [`ImageObject::upload`] after host
//! writes. Mapping an image does both implicitly.

use std::ptr::NonNull;
use std::sync::Arc;

use super::buffer::BufferObject;
use super::staging::StagingBuffer;
use super::{MemFlags, MemObjectType, MemoryCore, MemoryObject};
use crate::api::config::MemConfig;
use crate::error::{check_range, MemError, MemResult};
use crate::format::{fill_region, pack_pixels, unpack_pixel, FillColor, ImageFormat, PitchLayout, PixelColor};
use crate::gpu::{
    AllocationRequest, BufferImageCopy, Device, DeviceAllocation, DeviceCommand, Extent3D, ImageAllocationInfo,
    ImageCopy, ImageSubresourceLayers, ImageType, ImageUsage, MemoryProperties, Offset3D, ResourceUse, Serial,
    EXTERNAL_MEMORY_HOST,
};
use crate::sync::mutex::Mutex;
use crate::util::layout::{align_up, pitched_span};

/// What the other side of an image copy is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCopyWith {
    Buffer,
    Image,
}

/// Direction and host memory of a pitched staging copy.
#[derive(Debug)]
pub enum StagingCopy<'a> {
    /// Host bytes into the staging buffer
    ToStaging(&'a [u8]),
    /// Staging bytes out to host memory
    ToHost(&'a mut [u8]),
}

impl StagingCopy<'_> {
    fn len(&self) -> usize {
        match self {
            StagingCopy::ToStaging(src) => src.len(),
            StagingCopy::ToHost(dst) => dst.len(),
        }
    }
}

/// Host-side description of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub image_type: MemObjectType,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub array_size: usize,
    /// Row pitch of the initial host data in bytes, 0 for tightly packed
    pub row_pitch: usize,
    /// Slice (or layer) pitch of the initial host data in bytes, 0 for tightly packed
    pub slice_pitch: usize,
}

impl ImageDescriptor {
    fn with_type(image_type: MemObjectType, width: usize, height: usize, depth: usize, array_size: usize) -> Self {
        Self {
            image_type,
            width,
            height,
            depth,
            array_size,
            row_pitch: 0,
            slice_pitch: 0,
        }
    }

    pub fn image_1d(width: usize) -> Self {
        Self::with_type(MemObjectType::Image1D, width, 1, 1, 1)
    }

    pub fn image_1d_buffer(width: usize) -> Self {
        Self::with_type(MemObjectType::Image1DBuffer, width, 1, 1, 1)
    }

    pub fn image_1d_array(width: usize, layers: usize) -> Self {
        Self::with_type(MemObjectType::Image1DArray, width, 1, 1, layers)
    }

    pub fn image_2d(width: usize, height: usize) -> Self {
        Self::with_type(MemObjectType::Image2D, width, height, 1, 1)
    }

    pub fn image_2d_array(width: usize, height: usize, layers: usize) -> Self {
        Self::with_type(MemObjectType::Image2DArray, width, height, 1, layers)
    }

    pub fn image_3d(width: usize, height: usize, depth: usize) -> Self {
        Self::with_type(MemObjectType::Image3D, width, height, depth, 1)
    }

    /// Pitches of the initial host data.
    pub fn with_pitches(mut self, row_pitch: usize, slice_pitch: usize) -> Self {
        self.row_pitch = row_pitch;
        self.slice_pitch = slice_pitch;
        self
    }

    /// Check the dimensions and reset the ones the image type does not use.
    fn normalized(mut self) -> MemResult<Self> {
        use MemObjectType::*;
        let dims = self.axes();
        if dims == 0 {
            return Err(MemError::InvalidValue("descriptor does not describe an image"));
        }
        if self.width == 0 {
            return Err(MemError::InvalidValue("image width must be non-zero"));
        }
        if matches!(self.image_type, Image2D | Image2DArray | Image3D) && self.height == 0 {
            return Err(MemError::InvalidValue("image height must be non-zero"));
        }
        if self.image_type == Image3D && self.depth == 0 {
            return Err(MemError::InvalidValue("image depth must be non-zero"));
        }
        if self.image_type.is_array() && self.array_size == 0 {
            return Err(MemError::InvalidValue("image array size must be at least 1"));
        }

        if matches!(self.image_type, Image1D | Image1DBuffer | Image1DArray) {
            self.height = 1;
        }
        if self.image_type != Image3D {
            self.depth = 1;
        }
        if !self.image_type.is_array() {
            self.array_size = 1;
        }
        for value in [self.width, self.height, self.depth, self.array_size] {
            u32::try_from(value).map_err(|_| MemError::InvalidValue("image dimension exceeds u32"))?;
        }
        Ok(self)
    }

    /// Number of host coordinate axes the image uses.
    fn axes(&self) -> usize {
        match self.image_type {
            MemObjectType::Buffer => 0,
            MemObjectType::Image1D | MemObjectType::Image1DBuffer => 1,
            MemObjectType::Image1DArray | MemObjectType::Image2D => 2,
            MemObjectType::Image2DArray | MemObjectType::Image3D => 3,
        }
    }

    /// Extent in host coordinates: (width, rows, slices).
    pub fn host_dims(&self) -> [usize; 3] {
        match self.image_type {
            MemObjectType::Image1DArray => [self.width, self.array_size, 1],
            MemObjectType::Image2DArray => [self.width, self.height, self.array_size],
            _ => [self.width, self.height, self.depth],
        }
    }

    fn device_type(&self) -> ImageType {
        match self.image_type {
            MemObjectType::Image2D | MemObjectType::Image2DArray => ImageType::D2,
            MemObjectType::Image3D => ImageType::D3,
            _ => ImageType::D1,
        }
    }
}

/// Host strides (between rows, between slices) of a region, with 0 meaning tight.
///
/// For 1D arrays the layers are host rows, so the caller's slice pitch is the stride
/// between them.
const SIZE_OVERFLOW: MemError = MemError::InvalidValue("image size overflows");

fn copy_u32(value: usize) -> MemResult<u32> {
    u32::try_from(value).map_err(|_| MemError::InvalidValue("copy coordinate exceeds u32"))
}

fn copy_i32(value: usize) -> MemResult<i32> {
    i32::try_from(value).map_err(|_| MemError::InvalidValue("copy offset exceeds i32"))
}

fn host_strides(
    kind: MemObjectType,
    element_size: usize,
    region: [usize; 3],
    row_pitch: usize,
    slice_pitch: usize,
) -> MemResult<(usize, usize)> {
    let row_bytes = region[0].checked_mul(element_size).ok_or(SIZE_OVERFLOW)?;
    let row_stride = match (kind, row_pitch, slice_pitch) {
        (MemObjectType::Image1DArray, _, slice) if slice != 0 => slice,
        (_, 0, _) => row_bytes,
        (_, row, _) => row,
    };
    if row_stride < row_bytes {
        return Err(MemError::InvalidValue("row pitch is smaller than a row"));
    }
    if kind != MemObjectType::Image1DArray && row_pitch % element_size != 0 {
        return Err(MemError::InvalidValue("row pitch must be a multiple of the element size"));
    }
    let slice_bytes = row_stride.checked_mul(region[1]).ok_or(SIZE_OVERFLOW)?;
    let slice_stride = match (kind, slice_pitch) {
        (MemObjectType::Image1DArray, _) | (_, 0) => slice_bytes,
        (_, slice) => slice,
    };
    if slice_stride < slice_bytes {
        return Err(MemError::InvalidValue("slice pitch is smaller than a slice"));
    }
    Ok((row_stride, slice_stride))
}

fn derive_image_usage(flags: MemFlags) -> ImageUsage {
    let usage = ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST | ImageUsage::SAMPLED;
    if flags.contains(MemFlags::READ_ONLY) {
        usage
    } else {
        usage | ImageUsage::STORAGE
    }
}

/// Copies between these kinds keep the same coordinate meaning on both sides.
fn same_family(a: MemObjectType, b: MemObjectType) -> bool {
    use MemObjectType::*;
    let family = |kind| match kind {
        Image1D | Image1DBuffer | Image1DArray => 1,
        Image2D | Image2DArray => 2,
        Image3D => 3,
        Buffer => 0,
    };
    family(a) == family(b)
}

/// A device image plus the staging buffer that mediates host access to it.
pub struct ImageObject {
    core: MemoryCore,
    allocation: DeviceAllocation,
    staging: Mutex<StagingBuffer>,
    staging_use: ResourceUse,
    extent: Extent3D,
    array_layers: u32,
    element_size: usize,
    row_pitch: usize,
    slice_pitch: usize,
    image_size: usize,
    format: ImageFormat,
    desc: ImageDescriptor,
    usage: ImageUsage,
}

impl std::fmt::Debug for ImageObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageObject")
            .field("core", &self.core)
            .field("allocation", &self.allocation.id())
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("array_layers", &self.array_layers)
            .field("row_pitch", &self.row_pitch)
            .field("slice_pitch", &self.slice_pitch)
            .finish()
    }
}

impl ImageObject {
    /// Allocate an image. `host` supplies the initial contents, laid out with the
    /// descriptor's pitches, and must be given exactly when `flags` contains
    /// `USE_HOST_PTR` or `COPY_HOST_PTR`.
    pub fn create(
        device: Arc<dyn Device>,
        config: &MemConfig,
        flags: MemFlags,
        format: ImageFormat,
        desc: ImageDescriptor,
        host: Option<&[u8]>,
    ) -> MemResult<Self> {
        flags.validate()?;
        let element_size = format.element_size()?;
        let desc = desc.normalized()?;
        let dims = desc.host_dims();

        let alignment = config.row_alignment.max(1).next_power_of_two();
        let row_bytes = dims[0].checked_mul(element_size).ok_or(SIZE_OVERFLOW)?;
        let row_pitch = align_up(row_bytes, alignment).ok_or(SIZE_OVERFLOW)?;
        let slice_pitch = match desc.image_type {
            MemObjectType::Image1DArray => row_pitch,
            MemObjectType::Image2DArray | MemObjectType::Image3D => {
                row_pitch.checked_mul(desc.height).ok_or(SIZE_OVERFLOW)?
            }
            _ => 0,
        };
        let image_size = row_pitch
            .checked_mul(dims[1])
            .and_then(|size| size.checked_mul(dims[2]))
            .filter(|&size| size <= isize::MAX as usize)
            .ok_or(SIZE_OVERFLOW)?;

        let host = match (host, flags.needs_host_data()) {
            (Some(data), true) => {
                let (row, slice) = host_strides(desc.image_type, element_size, dims, desc.row_pitch, desc.slice_pitch)?;
                let needed = pitched_span(row_bytes, dims[1], dims[2], row, slice).ok_or(SIZE_OVERFLOW)?;
                if data.len() < needed {
                    return Err(MemError::InvalidValue("host data is smaller than the image"));
                }
                Some(data)
            }
            (None, false) if desc.row_pitch != 0 || desc.slice_pitch != 0 => {
                return Err(MemError::InvalidValue("pitches given without host data"))
            }
            (None, false) => None,
            (Some(_), false) => return Err(MemError::InvalidValue("host data given without a host pointer flag")),
            (None, true) => return Err(MemError::InvalidValue("host pointer flag given without host data")),
        };

        let extent = Extent3D::new(desc.width as u32, desc.height as u32, desc.depth as u32);
        let array_layers = desc.array_size as u32;
        let usage = derive_image_usage(flags);
        let info = ImageAllocationInfo {
            image_type: desc.device_type(),
            extent,
            array_layers,
            element_size,
            usage,
        };
        let allocation = device.allocate(&AllocationRequest::image(info, MemoryProperties::DEVICE_LOCAL)?)?;

        let image = Self {
            core: MemoryCore::new(
                device.clone(),
                config.clone(),
                desc.image_type,
                flags,
                MemoryProperties::DEVICE_LOCAL,
            ),
            allocation,
            staging: Mutex::new(StagingBuffer::new(device, config)),
            staging_use: ResourceUse::new(),
            extent,
            array_layers,
            element_size,
            row_pitch,
            slice_pitch,
            image_size,
            format,
            desc,
            usage,
        };

        if let Some(data) = host {
            image.copy_staging_with_pitch(
                StagingCopy::ToStaging(data),
                [0; 3],
                dims,
                desc.row_pitch,
                desc.slice_pitch,
            )?;
            image.upload()?;
        }
        crate::dm_trace!(
            "image created ({:?} {}x{}x{} x{} layers, {} bytes)",
            desc.image_type,
            desc.width,
            desc.height,
            desc.depth,
            array_layers,
            image_size
        );
        Ok(image)
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.desc
    }

    pub fn extent(&self) -> Extent3D {
        self.extent
    }

    pub fn array_layers(&self) -> u32 {
        self.array_layers
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    /// 0 for 1D, 1D buffer and 2D images.
    pub fn slice_pitch(&self) -> usize {
        self.slice_pitch
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn image_type(&self) -> ImageType {
        self.desc.device_type()
    }

    pub fn image_usage_flags(&self) -> ImageUsage {
        self.usage
    }

    pub fn allocation(&self) -> &DeviceAllocation {
        &self.allocation
    }

    /// Whether the device can import host memory directly.
    pub fn contains_host_mem_extension(&self) -> bool {
        self.core.device().limits().has_extension(EXTERNAL_MEMORY_HOST)
    }

    /// Extent in host coordinates: (width, rows, slices).
    pub fn host_dims(&self) -> [usize; 3] {
        self.desc.host_dims()
    }

    fn native_layout(&self) -> PitchLayout {
        PitchLayout {
            element_size: self.element_size,
            row_pitch: self.row_pitch,
            slice_pitch: self.slice_pitch,
        }
    }

    /// Validate a host-coordinate region against the image.
    fn check_region(&self, origin: [usize; 3], region: [usize; 3]) -> MemResult<()> {
        if region.contains(&0) {
            return Err(MemError::InvalidValue("region dimensions must be non-zero"));
        }
        let dims = self.host_dims();
        for axis in self.desc.axes()..3 {
            if origin[axis] != 0 || region[axis] != 1 {
                return Err(MemError::InvalidState("region has more dimensions than the image"));
            }
        }
        for axis in 0..3 {
            check_range(origin[axis], region[axis], dims[axis])?;
        }
        Ok(())
    }

    /// Copy `src` into the staging buffer at byte `offset`.
    pub fn copy_staging_from(&self, src: &[u8], offset: usize) -> MemResult<()> {
        check_range(offset, src.len(), self.image_size)?;
        let mut staging = self.staging.lock();
        staging.ensure(self.image_size)?;
        staging.write(offset, src)
    }

    /// Copy staging bytes at `offset` out into `dst`.
    pub fn copy_staging_to(&self, dst: &mut [u8], offset: usize) -> MemResult<()> {
        check_range(offset, dst.len(), self.image_size)?;
        let mut staging = self.staging.lock();
        staging.ensure(self.image_size)?;
        staging.read(offset, dst)
    }

    /// Copy a region between host memory laid out with `row_pitch`/`slice_pitch`
    /// (0 = tight) and the staging buffer, row by row.
    pub fn copy_staging_with_pitch(
        &self,
        copy: StagingCopy<'_>,
        origin: [usize; 3],
        region: [usize; 3],
        row_pitch: usize,
        slice_pitch: usize,
    ) -> MemResult<()> {
        self.check_region(origin, region)?;
        let e = self.element_size;
        let (host_row, host_slice) = host_strides(self.kind(), e, region, row_pitch, slice_pitch)?;
        let row_bytes = region[0] * e;
        let span = pitched_span(row_bytes, region[1], region[2], host_row, host_slice).ok_or(SIZE_OVERFLOW)?;
        check_range(0, span, copy.len())?;

        let layout = self.native_layout();
        let mut staging = self.staging.lock();
        staging.ensure(self.image_size)?;
        let mut copy = copy;
        staging.with_mapped(self.image_size, |bytes| {
            for z in 0..region[2] {
                for y in 0..region[1] {
                    let host_at = z * host_slice + y * host_row;
                    let image_at = layout.offset_of([origin[0], origin[1] + y, origin[2] + z]);
                    let image_row = &mut bytes[image_at..image_at + row_bytes];
                    match &mut copy {
                        StagingCopy::ToStaging(src) => image_row.copy_from_slice(&src[host_at..host_at + row_bytes]),
                        StagingCopy::ToHost(dst) => dst[host_at..host_at + row_bytes].copy_from_slice(image_row),
                    }
                }
            }
        })
    }

    /// Convert a fill color into this image's pixel representation.
    pub fn pack_pixels(&self, color: &FillColor) -> MemResult<PixelColor> {
        pack_pixels(&self.format, color)
    }

    /// Replicate `pixel` over a region of `dst`, which uses the image's native layout.
    pub fn fill_image_with_color(
        &self,
        origin: [usize; 3],
        region: [usize; 3],
        dst: &mut [u8],
        pixel: &PixelColor,
    ) -> MemResult<()> {
        self.check_region(origin, region)?;
        let bytes = pixel.encode(self.format.channel_count());
        if bytes.as_slice().len() != self.element_size {
            return Err(MemError::InvalidValue("pixel does not match the image format"));
        }
        fill_region(dst, &self.native_layout(), origin, region, bytes.as_slice())
    }

    /// Fill a region of the device image with `color`.
    ///
    /// Partial fills read the image back first so the bytes outside the region survive
    /// the upload.
    pub fn fill_with_color(&self, origin: [usize; 3], region: [usize; 3], color: FillColor) -> MemResult<Serial> {
        let _unmapped = self.core.lock_unmapped()?;
        self.check_region(origin, region)?;
        let pixel = self.pack_pixels(&color)?;

        if origin != [0; 3] || region != self.host_dims() {
            self.transfer_to_staging()?;
        }
        {
            let mut staging = self.staging.lock();
            staging.ensure(self.image_size)?;
            staging.with_mapped(self.image_size, |bytes| {
                self.fill_image_with_color(origin, region, bytes, &pixel)
            })??;
        }
        self.upload()
    }

    /// Read one texel back from the device image.
    pub fn read_pixel(&self, origin: [usize; 3]) -> MemResult<FillColor> {
        self.check_region(origin, [1, 1, 1])?;
        self.readback()?;
        let mut bytes = [0u8; 16];
        let texel = &mut bytes[..self.element_size];
        self.copy_staging_to(texel, self.native_layout().offset_of(origin))?;
        let pixel = PixelColor::decode(&self.format, texel)?;
        unpack_pixel(&self.format, &pixel)
    }

    /// Device extent of a host region.
    pub fn get_extent_for_copy(&self, region: [usize; 3]) -> MemResult<Extent3D> {
        let mut extent = Extent3D::new(copy_u32(region[0])?, copy_u32(region[1])?, copy_u32(region[2])?);
        match self.kind() {
            MemObjectType::Image1DArray => {
                extent.height = 1;
                extent.depth = 1;
            }
            MemObjectType::Image2DArray => extent.depth = 1,
            _ => {}
        }
        Ok(extent)
    }

    /// Device offset of a host origin; layer coordinates are dropped.
    pub fn get_offset_for_copy(&self, origin: [usize; 3]) -> MemResult<Offset3D> {
        let mut offset = Offset3D::new(copy_i32(origin[0])?, copy_i32(origin[1])?, copy_i32(origin[2])?);
        match self.kind() {
            MemObjectType::Image1DArray => {
                offset.y = 0;
                offset.z = 0;
            }
            MemObjectType::Image2DArray => offset.z = 0,
            _ => {}
        }
        Ok(offset)
    }

    /// Array layers touched by a copy of `region` at `origin`.
    ///
    /// The layer range comes from the region. When the other side is a non-array image
    /// only one layer takes part.
    pub fn get_subresource_layers_for_copy(
        &self,
        origin: [usize; 3],
        region: [usize; 3],
        copy_to_type: MemObjectType,
        with: ImageCopyWith,
    ) -> MemResult<ImageSubresourceLayers> {
        let single_with_image = with == ImageCopyWith::Image && !copy_to_type.is_array();
        let layer_axis = match self.kind() {
            MemObjectType::Image1DArray => 1,
            MemObjectType::Image2DArray => 2,
            _ => {
                return Ok(ImageSubresourceLayers {
                    base_array_layer: 0,
                    layer_count: 1,
                })
            }
        };
        Ok(ImageSubresourceLayers {
            base_array_layer: copy_u32(origin[layer_axis])?,
            layer_count: if single_with_image { 1 } else { copy_u32(region[layer_axis])? },
        })
    }

    /// Staging layout of the whole image as a buffer/image copy.
    fn full_copy(&self) -> BufferImageCopy {
        let image_height = match self.kind() {
            MemObjectType::Image1DArray => 1,
            _ => self.extent.height,
        };
        BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: (self.row_pitch / self.element_size) as u32,
            buffer_image_height: image_height,
            subresource: ImageSubresourceLayers {
                base_array_layer: 0,
                layer_count: self.array_layers,
            },
            image_offset: Offset3D::default(),
            image_extent: self.extent,
        }
    }

    fn region_copy(&self, buffer_offset: usize, origin: [usize; 3], region: [usize; 3]) -> MemResult<BufferImageCopy> {
        Ok(BufferImageCopy {
            buffer_offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            subresource: self.get_subresource_layers_for_copy(
                origin,
                region,
                MemObjectType::Buffer,
                ImageCopyWith::Buffer,
            )?,
            image_offset: self.get_offset_for_copy(origin)?,
            image_extent: self.get_extent_for_copy(region)?,
        })
    }

    fn staging_allocation(&self, staging: &mut StagingBuffer) -> MemResult<DeviceAllocation> {
        Ok(staging.ensure(self.image_size)?.clone())
    }

    /// Record a copy of the whole staging buffer into the device image.
    pub fn upload(&self) -> MemResult<Serial> {
        let src = self.staging_allocation(&mut self.staging.lock())?;
        let serial = self.core.device().submit(DeviceCommand::CopyBufferToImage {
            src,
            dst: self.allocation.clone(),
            region: self.full_copy(),
        })?;
        self.staging_use.record(serial);
        Ok(serial)
    }

    /// Copy the device image into the staging buffer and wait for it.
    pub fn readback(&self) -> MemResult<()> {
        let _unmapped = self.core.lock_unmapped()?;
        self.transfer_to_staging()
    }

    fn transfer_to_staging(&self) -> MemResult<()> {
        let dst = self.staging_allocation(&mut self.staging.lock())?;
        let device = self.core.device();
        let serial = device.submit(DeviceCommand::CopyImageToBuffer {
            src: self.allocation.clone(),
            dst,
            region: self.full_copy(),
        })?;
        self.staging_use.record(serial);
        device.wait(serial)?;
        Ok(())
    }

    /// Record a copy of a region into `dst`, tightly packed at `dst_offset`.
    pub fn copy_to_buffer(
        &self,
        dst: &BufferObject,
        origin: [usize; 3],
        region: [usize; 3],
        dst_offset: usize,
    ) -> MemResult<Serial> {
        self.check_region(origin, region)?;
        let bytes = region.iter().product::<usize>() * self.element_size;
        check_range(dst_offset, bytes, dst.size())?;
        let serial = self.core.device().submit(DeviceCommand::CopyImageToBuffer {
            src: self.allocation.clone(),
            dst: dst.allocation().clone(),
            region: self.region_copy(dst.offset() + dst_offset, origin, region)?,
        })?;
        Ok(serial)
    }

    /// Record a copy of tightly packed texels at `src_offset` in `src` into a region.
    pub fn copy_from_buffer(
        &self,
        src: &BufferObject,
        src_offset: usize,
        origin: [usize; 3],
        region: [usize; 3],
    ) -> MemResult<Serial> {
        self.check_region(origin, region)?;
        let bytes = region.iter().product::<usize>() * self.element_size;
        check_range(src_offset, bytes, src.size())?;
        let serial = self.core.device().submit(DeviceCommand::CopyBufferToImage {
            src: src.allocation().clone(),
            dst: self.allocation.clone(),
            region: self.region_copy(src.offset() + src_offset, origin, region)?,
        })?;
        Ok(serial)
    }

    /// Record a texel copy into another image of the same format.
    pub fn copy_to_image(
        &self,
        dst: &ImageObject,
        src_origin: [usize; 3],
        dst_origin: [usize; 3],
        region: [usize; 3],
    ) -> MemResult<Serial> {
        if self.format != dst.format {
            return Err(MemError::InvalidValue("image formats differ"));
        }
        if !same_family(self.kind(), dst.kind()) {
            return Err(MemError::InvalidValue("images have different dimensionality"));
        }
        self.check_region(src_origin, region)?;
        dst.check_region(dst_origin, region)?;
        if std::ptr::eq(self, dst) {
            let overlaps = (0..3).all(|axis| {
                src_origin[axis] < dst_origin[axis] + region[axis] && dst_origin[axis] < src_origin[axis] + region[axis]
            });
            if overlaps {
                return Err(MemError::InvalidValue("source and destination regions overlap"));
            }
        }

        let copy = ImageCopy {
            src_subresource: self.get_subresource_layers_for_copy(src_origin, region, dst.kind(), ImageCopyWith::Image)?,
            src_offset: self.get_offset_for_copy(src_origin)?,
            dst_subresource: dst.get_subresource_layers_for_copy(dst_origin, region, self.kind(), ImageCopyWith::Image)?,
            dst_offset: dst.get_offset_for_copy(dst_origin)?,
            extent: self.get_extent_for_copy(region)?,
        };
        let serial = self.core.device().submit(DeviceCommand::CopyImage {
            src: self.allocation.clone(),
            dst: dst.allocation.clone(),
            region: copy,
        })?;
        Ok(serial)
    }
}

impl MemoryObject for ImageObject {
    fn core(&self) -> &MemoryCore {
        &self.core
    }

    fn size(&self) -> usize {
        self.image_size
    }

    fn map_impl(&self) -> MemResult<NonNull<u8>> {
        let mut staging = self.staging.lock();
        staging.ensure(self.image_size)?;
        staging.map()
    }

    fn unmap_impl(&self) {
        self.staging.lock().unmap();
    }

    fn prepare_map(&self) -> MemResult<()> {
        self.transfer_to_staging()
    }

    fn finish_unmap(&self) -> MemResult<()> {
        self.upload().map(|_| ())
    }

    fn is_currently_in_use(&self) -> bool {
        let device = self.core.device();
        !device.has_resource_use_finished(self.allocation.resource_use())
            || !device.has_resource_use_finished(&self.staging_use)
    }

    /// Byte copy in the native layout of both images, through their staging buffers.
    fn copy_to_object(&self, dst: &Self, src_offset: usize, dst_offset: usize, size: usize) -> MemResult<Serial> {
        if size == 0 {
            return Err(MemError::InvalidValue("copy size must be non-zero"));
        }
        check_range(src_offset, size, self.image_size)?;
        check_range(dst_offset, size, dst.image_size)?;
        let same = std::ptr::eq(self, dst);
        // Two images are always locked in address order.
        let _unmapped = match (same, (self as *const Self) < (dst as *const Self)) {
            (true, _) => (self.core.lock_unmapped()?, None),
            (false, true) => {
                let src = self.core.lock_unmapped()?;
                (src, Some(dst.core.lock_unmapped()?))
            }
            (false, false) => {
                let dst_guard = dst.core.lock_unmapped()?;
                (self.core.lock_unmapped()?, Some(dst_guard))
            }
        };
        if same && src_offset < dst_offset + size && dst_offset < src_offset + size {
            return Err(MemError::InvalidValue("source and destination ranges overlap"));
        }

        self.transfer_to_staging()?;
        let mut bytes = vec![0u8; size];
        self.copy_staging_to(&mut bytes, src_offset)?;
        if !same {
            dst.transfer_to_staging()?;
        }
        dst.copy_staging_from(&bytes, dst_offset)?;
        dst.upload()
    }

    fn create_sub_buffer(&self, _flags: MemFlags, _offset: usize, _size: usize) -> MemResult<BufferObject> {
        Err(MemError::InvalidState("images do not support sub-buffers"))
    }
}

impl Drop for ImageObject {
    fn drop(&mut self) {
        {
            let mut state = self.core.lock_map();
            if state.count > 0 {
                crate::dm_emit!(DM002, "image dropped with {} outstanding maps", state.count);
                self.unmap_impl();
                *state = Default::default();
            }
        }
        self.core.device().free(&self.allocation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{ChannelOrder, ChannelType};
    use crate::gpu::{DeviceError, DeviceLimits, HostDevice};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::thread;
    use std::time::Duration;

    /// Host device that can park the next image readback and refuse uploads.
    #[derive(Debug)]
    struct GatedDevice {
        inner: HostDevice,
        gate: std::sync::Mutex<Option<(Sender<()>, Receiver<()>)>>,
        fail_uploads: AtomicBool,
    }

    impl GatedDevice {
        fn new() -> Self {
            Self {
                inner: HostDevice::new(),
                gate: std::sync::Mutex::new(None),
                fail_uploads: AtomicBool::new(false),
            }
        }

        /// Park the next `CopyImageToBuffer` submit. Returns (reached, release).
        fn arm(&self) -> (Receiver<()>, Sender<()>) {
            let (reached_tx, reached_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            *self.gate.lock().unwrap() = Some((reached_tx, release_rx));
            (reached_rx, release_tx)
        }
    }

    impl Device for GatedDevice {
        fn allocate(&self, request: &AllocationRequest) -> Result<DeviceAllocation, DeviceError> {
            self.inner.allocate(request)
        }

        fn free(&self, allocation: &DeviceAllocation) {
            self.inner.free(allocation)
        }

        fn map(&self, allocation: &DeviceAllocation) -> Result<NonNull<u8>, DeviceError> {
            self.inner.map(allocation)
        }

        fn unmap(&self, allocation: &DeviceAllocation) {
            self.inner.unmap(allocation)
        }

        fn submit(&self, command: DeviceCommand) -> Result<Serial, DeviceError> {
            match &command {
                DeviceCommand::CopyImageToBuffer { .. } => {
                    let gate = self.gate.lock().unwrap().take();
                    if let Some((reached, release)) = gate {
                        reached.send(()).unwrap();
                        release.recv().unwrap();
                    }
                }
                DeviceCommand::CopyBufferToImage { .. } if self.fail_uploads.load(Ordering::SeqCst) => {
                    return Err(DeviceError::InvalidCommand("uploads disabled"));
                }
                _ => {}
            }
            self.inner.submit(command)
        }

        fn wait(&self, serial: Serial) -> Result<(), DeviceError> {
            self.inner.wait(serial)
        }

        fn has_resource_use_finished(&self, resource_use: &ResourceUse) -> bool {
            self.inner.has_resource_use_finished(resource_use)
        }

        fn limits(&self) -> &DeviceLimits {
            self.inner.limits()
        }
    }

    fn rgba8() -> ImageFormat {
        ImageFormat::new(ChannelOrder::Rgba, ChannelType::UnormInt8)
    }

    fn r8() -> ImageFormat {
        ImageFormat::new(ChannelOrder::R, ChannelType::UnsignedInt8)
    }

    fn image(device: &Arc<HostDevice>, config: &MemConfig, format: ImageFormat, desc: ImageDescriptor) -> ImageObject {
        ImageObject::create(device.clone(), config, MemFlags::READ_WRITE, format, desc, None).unwrap()
    }

    #[test]
    fn test_pitch_computation() {
        let device = Arc::new(HostDevice::new());
        let aligned = MemConfig::default().with_row_alignment(64);

        let plain = image(&device, &aligned, rgba8(), ImageDescriptor::image_2d(10, 4));
        assert_eq!(plain.row_pitch(), 64);
        assert_eq!(plain.slice_pitch(), 0);
        assert_eq!(plain.image_size(), 256);

        let array = image(&device, &aligned, rgba8(), ImageDescriptor::image_2d_array(10, 4, 3));
        assert_eq!(array.slice_pitch(), 256);
        assert_eq!(array.image_size(), 768);

        let volume = image(&device, &aligned, rgba8(), ImageDescriptor::image_3d(16, 2, 5));
        assert_eq!(volume.row_pitch(), 64);
        assert_eq!(volume.slice_pitch(), 128);

        let layers = image(&device, &aligned, rgba8(), ImageDescriptor::image_1d_array(3, 7));
        assert_eq!(layers.slice_pitch(), layers.row_pitch());
        assert_eq!(layers.image_size(), 64 * 7);

        let line = image(&device, &aligned, rgba8(), ImageDescriptor::image_1d(3));
        assert_eq!(line.slice_pitch(), 0);
    }

    #[test]
    fn test_tight_size_matches_texel_count() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::default();
        let format = ImageFormat::new(ChannelOrder::Rg, ChannelType::HalfFloat);
        let array = image(&device, &config, format, ImageDescriptor::image_2d_array(5, 3, 2));
        assert_eq!(array.image_size(), 4 * 5 * 3 * 2);
        assert_eq!(array.extent(), Extent3D::new(5, 3, 1));
        assert_eq!(array.array_layers(), 2);
    }

    #[test]
    fn test_oversized_image_is_rejected() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::default();
        let rgba_f32 = ImageFormat::new(ChannelOrder::Rgba, ChannelType::Float);

        let huge = ImageObject::create(
            device.clone(),
            &config,
            MemFlags::READ_WRITE,
            rgba_f32,
            ImageDescriptor::image_3d(1 << 20, 1 << 20, 1 << 20),
            None,
        );
        assert!(matches!(huge, Err(MemError::InvalidValue(_))));

        let wide_rows = ImageObject::create(
            device.clone(),
            &config.clone().with_row_alignment(1 << 20),
            MemFlags::READ_WRITE,
            rgba_f32,
            ImageDescriptor::image_2d_array(u32::MAX as usize, 1 << 16, 1 << 16),
            None,
        );
        assert!(matches!(wide_rows, Err(MemError::InvalidValue(_))));

        let pitch = (usize::MAX / 4) & !3;
        let host = [0u8; 128];
        let pitched = ImageObject::create(
            device.clone(),
            &config,
            MemFlags::READ_WRITE | MemFlags::COPY_HOST_PTR,
            rgba8(),
            ImageDescriptor::image_3d(4, 4, 2).with_pitches(pitch, 0),
            Some(&host),
        );
        assert!(matches!(pitched, Err(MemError::InvalidValue(_))));
        assert_eq!(device.stats().live_allocations, 0);
    }

    #[test]
    fn test_descriptor_validation() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::default();
        let create = |desc| ImageObject::create(device.clone(), &config, MemFlags::READ_WRITE, rgba8(), desc, None);

        assert!(create(ImageDescriptor::image_2d(0, 4)).is_err());
        assert!(create(ImageDescriptor::image_3d(4, 4, 0)).is_err());
        assert!(create(ImageDescriptor::image_2d_array(4, 4, 0)).is_err());
        assert!(create(ImageDescriptor::image_2d(4, 4).with_pitches(64, 0)).is_err());

        let bad = ImageObject::create(
            device.clone(),
            &config,
            MemFlags::READ_WRITE,
            ImageFormat::new(ChannelOrder::Rgb, ChannelType::UnormInt8),
            ImageDescriptor::image_2d(4, 4),
            None,
        );
        assert!(matches!(bad, Err(MemError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_create_with_pitched_host_data() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::default();
        // 3x2 R8 image, host rows padded to 4 bytes.
        let host = [1, 2, 3, 0xFF, 4, 5, 6, 0xFF];
        let image = ImageObject::create(
            device.clone(),
            &config,
            MemFlags::COPY_HOST_PTR,
            r8(),
            ImageDescriptor::image_2d(3, 2).with_pitches(4, 0),
            Some(&host),
        )
        .unwrap();
        device.finish().unwrap();
        assert_eq!(device.read_allocation(image.allocation()).unwrap(), vec![1, 2, 3, 4, 5, 6]);

        let short = ImageObject::create(
            device.clone(),
            &config,
            MemFlags::COPY_HOST_PTR,
            r8(),
            ImageDescriptor::image_2d(3, 2).with_pitches(4, 0),
            Some(&host[..6]),
        );
        assert!(matches!(short, Err(MemError::InvalidValue(_))));
    }

    #[test]
    fn test_fill_red_reads_back() {
        let device = Arc::new(HostDevice::new());
        let image = image(&device, &MemConfig::default(), rgba8(), ImageDescriptor::image_2d(64, 64));
        let serial = image
            .fill_with_color([0, 0, 0], [64, 64, 1], FillColor::Float([1.0, 0.0, 0.0, 1.0]))
            .unwrap();
        assert!(image.is_currently_in_use());
        device.wait(serial).unwrap();
        assert!(!image.is_currently_in_use());

        image.readback().unwrap();
        let mut texel = [0u8; 4];
        image.copy_staging_to(&mut texel, image.row_pitch() * 37 + 4 * 12).unwrap();
        assert_eq!(texel, [255, 0, 0, 255]);
        assert_eq!(image.read_pixel([63, 63, 0]).unwrap(), FillColor::Float([1.0, 0.0, 0.0, 1.0]));
    }

    #[test]
    fn test_partial_fill_touches_only_region() {
        let device = Arc::new(HostDevice::new());
        let image = image(&device, &MemConfig::default(), r8(), ImageDescriptor::image_2d(4, 4));
        image.fill_with_color([0, 0, 0], [4, 4, 1], FillColor::Uint([1, 0, 0, 0])).unwrap();
        image.fill_with_color([1, 2, 0], [2, 1, 1], FillColor::Uint([9, 0, 0, 0])).unwrap();

        image.readback().unwrap();
        let mut all = [0u8; 16];
        image.copy_staging_to(&mut all, 0).unwrap();
        assert_eq!(all, [1, 1, 1, 1, 1, 1, 1, 1, 1, 9, 9, 1, 1, 1, 1, 1]);
    }

    #[test]
    fn test_fill_class_mismatch() {
        let device = Arc::new(HostDevice::new());
        let image = image(&device, &MemConfig::default(), r8(), ImageDescriptor::image_2d(4, 4));
        let result = image.fill_with_color([0, 0, 0], [1, 1, 1], FillColor::Float([1.0; 4]));
        assert!(matches!(result, Err(MemError::UnsupportedFormat { .. })));
    }

    #[test]
    fn test_fill_image_with_color_into_host_buffer() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::default().with_row_alignment(8);
        let image = image(&device, &config, r8(), ImageDescriptor::image_2d(5, 3));
        let pixel = image.pack_pixels(&FillColor::Uint([7, 0, 0, 0])).unwrap();
        let mut dst = vec![0u8; image.image_size()];
        image.fill_image_with_color([1, 1, 0], [3, 2, 1], &mut dst, &pixel).unwrap();

        for (offset, byte) in dst.iter().enumerate() {
            let (row, col) = (offset / 8, offset % 8);
            let inside = (1..3).contains(&row) && (1..4).contains(&col);
            assert_eq!(*byte, if inside { 7 } else { 0 }, "byte {}", offset);
        }

        let wrong = PixelColor::U16([7, 0, 0, 0]);
        assert!(image.fill_image_with_color([0, 0, 0], [1, 1, 1], &mut dst, &wrong).is_err());
    }

    #[test]
    fn test_pitched_staging_round_trip() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::default().with_debug(false);
        let image = image(&device, &config, r8(), ImageDescriptor::image_3d(4, 4, 2));
        let src = [1, 2, 0, 3, 4, 0, 0, 0, 5, 6, 0, 7, 8, 0, 0, 0];
        image
            .copy_staging_with_pitch(StagingCopy::ToStaging(&src), [1, 1, 0], [2, 2, 2], 3, 8)
            .unwrap();

        let mut back = [0u8; 8];
        image
            .copy_staging_with_pitch(StagingCopy::ToHost(&mut back), [1, 1, 0], [2, 2, 2], 0, 0)
            .unwrap();
        assert_eq!(back, [1, 2, 3, 4, 5, 6, 7, 8]);

        let mut row = [0u8; 4];
        image.copy_staging_to(&mut row, 16 + 4).unwrap();
        assert_eq!(row, [0, 5, 6, 0]);
    }

    #[test]
    fn test_pitched_copy_validation() {
        let device = Arc::new(HostDevice::new());
        let image = image(&device, &MemConfig::default(), r8(), ImageDescriptor::image_2d(4, 4));
        let src = [0u8; 64];
        let copy = |origin, region, row| {
            image.copy_staging_with_pitch(StagingCopy::ToStaging(&src), origin, region, row, 0)
        };
        assert!(matches!(copy([0, 0, 0], [2, 2, 2], 0), Err(MemError::InvalidState(_))));
        assert!(matches!(copy([0, 0, 1], [2, 2, 1], 0), Err(MemError::InvalidState(_))));
        assert!(matches!(copy([3, 0, 0], [2, 1, 1], 0), Err(MemError::OutOfBounds { .. })));
        assert!(matches!(copy([0, 0, 0], [0, 1, 1], 0), Err(MemError::InvalidValue(_))));
        assert!(matches!(copy([0, 0, 0], [4, 2, 1], 2), Err(MemError::InvalidValue(_))));
        assert!(matches!(copy([0, 0, 0], [4, 4, 1], 21), Err(MemError::OutOfBounds { .. })));
        assert!(copy([0, 0, 0], [4, 4, 1], 0).is_ok());
    }

    #[test]
    fn test_geometry_helpers() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::default();
        let layers_1d = image(&device, &config, r8(), ImageDescriptor::image_1d_array(8, 6));
        assert_eq!(layers_1d.get_extent_for_copy([4, 3, 1]).unwrap(), Extent3D::new(4, 1, 1));
        assert_eq!(layers_1d.get_offset_for_copy([2, 1, 0]).unwrap(), Offset3D::new(2, 0, 0));
        let sub = layers_1d.get_subresource_layers_for_copy([2, 1, 0], [4, 3, 1], MemObjectType::Buffer, ImageCopyWith::Buffer).unwrap();
        assert_eq!(sub, ImageSubresourceLayers { base_array_layer: 1, layer_count: 3 });

        let layers_2d = image(&device, &config, r8(), ImageDescriptor::image_2d_array(8, 8, 4));
        assert_eq!(layers_2d.get_extent_for_copy([4, 4, 2]).unwrap(), Extent3D::new(4, 4, 1));
        assert_eq!(layers_2d.get_offset_for_copy([1, 2, 3]).unwrap(), Offset3D::new(1, 2, 0));
        let to_buffer = layers_2d.get_subresource_layers_for_copy([0, 0, 1], [4, 4, 2], MemObjectType::Buffer, ImageCopyWith::Buffer).unwrap();
        assert_eq!(to_buffer, ImageSubresourceLayers { base_array_layer: 1, layer_count: 2 });
        let to_plain = layers_2d.get_subresource_layers_for_copy([0, 0, 3], [4, 4, 1], MemObjectType::Image2D, ImageCopyWith::Image).unwrap();
        assert_eq!(to_plain, ImageSubresourceLayers { base_array_layer: 3, layer_count: 1 });
        let to_array = layers_2d.get_subresource_layers_for_copy([0, 0, 0], [4, 4, 3], MemObjectType::Image2DArray, ImageCopyWith::Image).unwrap();
        assert_eq!(to_array.layer_count, 3);

        let volume = image(&device, &config, r8(), ImageDescriptor::image_3d(4, 4, 4));
        assert_eq!(volume.get_extent_for_copy([2, 3, 4]).unwrap(), Extent3D::new(2, 3, 4));
        assert_eq!(volume.get_offset_for_copy([1, 1, 1]).unwrap(), Offset3D::new(1, 1, 1));
        let sub = volume.get_subresource_layers_for_copy([1, 1, 1], [2, 2, 2], MemObjectType::Buffer, ImageCopyWith::Buffer).unwrap();
        assert_eq!(sub, ImageSubresourceLayers { base_array_layer: 0, layer_count: 1 });

        let beyond_u32 = u32::MAX as usize + 1;
        assert!(matches!(volume.get_extent_for_copy([beyond_u32, 1, 1]), Err(MemError::InvalidValue(_))));
        assert!(matches!(volume.get_offset_for_copy([0, i32::MAX as usize + 1, 0]), Err(MemError::InvalidValue(_))));
        assert!(layers_2d
            .get_subresource_layers_for_copy([0, 0, beyond_u32], [1, 1, 1], MemObjectType::Buffer, ImageCopyWith::Buffer)
            .is_err());
        assert!(matches!(
            volume.copy_to_image(&volume, [0, 0, 0], [usize::MAX, 0, 0], [1, 1, 1]),
            Err(MemError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_buffer_round_trip_through_array_layers() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::default();
        let image = image(&device, &config, r8(), ImageDescriptor::image_2d_array(2, 2, 3));
        let data: Vec<u8> = (1..=8).collect();
        let src = BufferObject::create(device.clone(), &config, MemFlags::COPY_HOST_PTR, 8, Some(&data)).unwrap();
        let dst = BufferObject::create(device.clone(), &config, MemFlags::READ_WRITE, 16, None).unwrap();

        image.copy_from_buffer(&src, 0, [0, 0, 1], [2, 2, 2]).unwrap();
        let serial = image.copy_to_buffer(&dst, [0, 0, 1], [2, 2, 2], 8).unwrap();
        device.wait(serial).unwrap();

        let mut out = [0u8; 8];
        dst.copy_to(&mut out, 8).unwrap();
        assert_eq!(out.to_vec(), data);
        assert_eq!(image.read_pixel([1, 1, 0]).unwrap(), FillColor::Uint([0, 0, 0, 1]));
        assert_eq!(image.read_pixel([1, 0, 2]).unwrap(), FillColor::Uint([6, 0, 0, 1]));

        assert!(image.copy_to_buffer(&dst, [0, 0, 0], [2, 2, 3], 8).is_err());
    }

    #[test]
    fn test_copy_between_images() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::default();
        let plain = image(&device, &config, r8(), ImageDescriptor::image_2d(4, 4));
        let array = image(&device, &config, r8(), ImageDescriptor::image_2d_array(4, 4, 2));
        plain.fill_with_color([0, 0, 0], [4, 4, 1], FillColor::Uint([3, 0, 0, 0])).unwrap();

        plain.copy_to_image(&array, [0, 0, 0], [2, 2, 1], [2, 2, 1]).unwrap();
        device.finish().unwrap();
        assert_eq!(array.read_pixel([3, 3, 1]).unwrap(), FillColor::Uint([3, 0, 0, 1]));
        assert_eq!(array.read_pixel([1, 1, 1]).unwrap(), FillColor::Uint([0, 0, 0, 1]));
        assert_eq!(array.read_pixel([3, 3, 0]).unwrap(), FillColor::Uint([0, 0, 0, 1]));

        let volume = image(&device, &config, r8(), ImageDescriptor::image_3d(4, 4, 2));
        assert!(plain.copy_to_image(&volume, [0; 3], [0; 3], [1, 1, 1]).is_err());
        let other_format = image(&device, &config, rgba8(), ImageDescriptor::image_2d(4, 4));
        assert!(plain.copy_to_image(&other_format, [0; 3], [0; 3], [1, 1, 1]).is_err());
        assert!(plain.copy_to_image(&plain, [0; 3], [1, 1, 0], [2, 2, 1]).is_err());
    }

    #[test]
    fn test_map_reads_and_writes_device_image() {
        let device = Arc::new(HostDevice::new());
        let image = image(&device, &MemConfig::default(), r8(), ImageDescriptor::image_2d(4, 2));
        image.fill_with_color([0, 0, 0], [4, 2, 1], FillColor::Uint([5, 0, 0, 0])).unwrap();

        let mut row = [0u8; 4];
        image.copy_to(&mut row, 4).unwrap();
        assert_eq!(row, [5; 4]);

        image.copy_from(&[8, 9], 1).unwrap();
        assert_eq!(image.read_pixel([2, 0, 0]).unwrap(), FillColor::Uint([9, 0, 0, 1]));

        image.map(0).unwrap();
        assert!(matches!(image.readback(), Err(MemError::InvalidState(_))));
        image.unmap().unwrap();
    }

    #[test]
    fn test_copy_to_object_bytes() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::default();
        let a = image(&device, &config, r8(), ImageDescriptor::image_2d(4, 1));
        let b = image(&device, &config, r8(), ImageDescriptor::image_2d(4, 1));
        a.copy_from(&[1, 2, 3, 4], 0).unwrap();
        let serial = a.copy_to_object(&b, 1, 0, 2).unwrap();
        device.wait(serial).unwrap();
        let mut out = [0u8; 4];
        b.copy_to(&mut out, 0).unwrap();
        assert_eq!(out, [2, 3, 0, 0]);
        assert!(a.copy_to_object(&b, 3, 0, 2).is_err());
    }

    #[test]
    fn test_no_sub_buffers_and_accessors() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::default();
        let image = ImageObject::create(
            device.clone(),
            &config,
            MemFlags::READ_ONLY,
            rgba8(),
            ImageDescriptor::image_1d_buffer(16),
            None,
        )
        .unwrap();
        assert!(matches!(image.create_sub_buffer(MemFlags::empty(), 0, 4), Err(MemError::InvalidState(_))));
        assert_eq!(image.image_type(), ImageType::D1);
        assert_eq!(image.kind(), MemObjectType::Image1DBuffer);
        assert!(!image.image_usage_flags().contains(ImageUsage::STORAGE));
        assert!(image.contains_host_mem_extension());
        assert_eq!(image.memory_property_flags(), MemoryProperties::DEVICE_LOCAL);
    }

    #[test]
    fn test_second_map_waits_for_first_readback() {
        let device = Arc::new(GatedDevice::new());
        let config = MemConfig::default();
        let image = Arc::new(
            ImageObject::create(device.clone(), &config, MemFlags::READ_WRITE, r8(), ImageDescriptor::image_2d(4, 4), None)
                .unwrap(),
        );
        let (reached, release) = device.arm();

        let first = {
            let image = image.clone();
            thread::spawn(move || image.map(0).unwrap().as_ptr() as usize)
        };
        reached.recv().unwrap();

        let second = {
            let image = image.clone();
            thread::spawn(move || {
                let ptr = image.map(0).unwrap();
                unsafe { ptr.as_ptr().write(0xAA) };
                ptr.as_ptr() as usize
            })
        };
        thread::sleep(Duration::from_millis(20));
        release.send(()).unwrap();

        let a = first.join().unwrap();
        let b = second.join().unwrap();
        assert_eq!(a, b);
        assert_eq!(image.map_count(), 2);
        assert_eq!(unsafe { *(b as *const u8) }, 0xAA);

        image.unmap().unwrap();
        image.unmap().unwrap();
        assert_eq!(image.read_pixel([0, 0, 0]).unwrap(), FillColor::Uint([0xAA, 0, 0, 1]));
    }

    #[test]
    fn test_failed_upload_keeps_mapping() {
        let device = Arc::new(GatedDevice::new());
        let config = MemConfig::default();
        let image =
            ImageObject::create(device.clone(), &config, MemFlags::READ_WRITE, r8(), ImageDescriptor::image_2d(4, 4), None)
                .unwrap();

        let ptr = image.map(0).unwrap();
        unsafe { ptr.as_ptr().add(5).write(0x5A) };

        device.fail_uploads.store(true, Ordering::SeqCst);
        assert!(matches!(image.unmap(), Err(MemError::OutOfResources(_))));
        assert_eq!(image.map_count(), 1);
        assert_eq!(image.map(0).unwrap(), ptr);
        image.unmap().unwrap();
        assert_eq!(image.map_count(), 1);

        device.fail_uploads.store(false, Ordering::SeqCst);
        image.unmap().unwrap();
        assert_eq!(image.map_count(), 0);
        assert_eq!(image.read_pixel([1, 1, 0]).unwrap(), FillColor::Uint([0x5A, 0, 0, 1]));
    }

    #[test]
    fn test_staging_operations_refuse_mapped_image() {
        let device = Arc::new(HostDevice::new());
        let config = MemConfig::default();
        let a = image(&device, &config, r8(), ImageDescriptor::image_2d(4, 1));
        let b = image(&device, &config, r8(), ImageDescriptor::image_2d(4, 1));

        b.map(0).unwrap();
        assert!(matches!(a.copy_to_object(&b, 0, 0, 2), Err(MemError::InvalidState(_))));
        assert!(matches!(b.copy_to_object(&a, 0, 0, 2), Err(MemError::InvalidState(_))));
        assert!(matches!(
            b.fill_with_color([0, 0, 0], [4, 1, 1], FillColor::Uint([1, 0, 0, 0])),
            Err(MemError::InvalidState(_))
        ));
        b.unmap().unwrap();

        a.copy_to_object(&b, 0, 0, 2).unwrap();
        b.copy_to_object(&a, 2, 2, 2).unwrap();
    }
}
