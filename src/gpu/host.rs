//! Host-memory device implementation for testing
//!
//! Every allocation is plain RAM, so no GPU is required. Submitted commands are queued
//! and only executed when the caller completes them (`finish`, `wait`), which makes the
//! in-flight query observable. `HostDevice::immediate` executes on submit instead.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::{self, NonNull};

use crossbeam_queue::SegQueue;

use super::traits::*;
use crate::sync::atomics::{AtomicCounter, AtomicGauge};
use crate::sync::mutex::Mutex;
use crate::util::size::{format_bytes, mb};

/// Extension name advertised for host-pointer imports.
pub const EXTERNAL_MEMORY_HOST: &str = "VK_EXT_external_memory_host";

const ALLOCATION_ALIGN: usize = 64;

/// Backing store of one allocation.
struct HostAllocation {
    base: NonNull<u8>,
    layout: Layout,
    size: usize,
    kind: ResourceKind,
    properties: MemoryProperties,
    map_count: u32,
}

// SAFETY: the block is owned by this record and only touched under the device lock or
// through pointers handed out by `map`, whose use the caller serializes.
unsafe impl Send for HostAllocation {}

impl HostAllocation {
    fn new(request: &AllocationRequest) -> Result<Self, DeviceError> {
        let layout = Layout::from_size_align(request.size.max(1), ALLOCATION_ALIGN)
            .map_err(|_| DeviceError::AllocationTooLarge {
                requested: request.size,
                limit: isize::MAX as usize,
            })?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(DeviceError::OutOfDeviceMemory {
            requested: request.size,
            available: 0,
        })?;
        Ok(Self {
            base,
            layout,
            size: request.size,
            kind: request.kind,
            properties: request.properties,
            map_count: 0,
        })
    }

    fn image_info(&self) -> Result<&ImageAllocationInfo, DeviceError> {
        match &self.kind {
            ResourceKind::Image(info) => Ok(info),
            ResourceKind::Buffer { .. } => Err(DeviceError::InvalidCommand("expected an image allocation")),
        }
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.base.as_ptr(), self.layout);
        }
    }
}

/// A command waiting for completion.
struct PendingCommand {
    serial: Serial,
    command: DeviceCommand,
}

/// Statistics snapshot for a [`HostDevice`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostDeviceStats {
    /// Currently allocated bytes
    pub allocated_bytes: usize,
    /// Peak allocated bytes
    pub peak_bytes: usize,
    /// Number of live allocations
    pub live_allocations: usize,
    /// Allocations with at least one outstanding map
    pub mapped_allocations: usize,
    /// Commands submitted but not yet executed
    pub pending_commands: usize,
    /// Frees waiting for their last use to complete
    pub deferred_frees: usize,
    /// Last submitted serial
    pub submitted: Serial,
    /// Last completed serial
    pub completed: Serial,
}

impl std::fmt::Display for HostDeviceStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} in {} allocations (peak {}), {} mapped, {} pending, {} deferred frees, serial {}/{}",
            format_bytes(self.allocated_bytes),
            self.live_allocations,
            format_bytes(self.peak_bytes),
            self.mapped_allocations,
            self.pending_commands,
            self.deferred_frees,
            self.completed.0,
            self.submitted.0,
        )
    }
}

/// A device that keeps every allocation in host memory.
pub struct HostDevice {
    limits: DeviceLimits,
    capacity: usize,
    immediate: bool,
    allocations: Mutex<HashMap<AllocationId, HostAllocation>>,
    next_id: AtomicCounter,
    /// Serializes serial assignment with queue order.
    submit_lock: Mutex<()>,
    /// Serializes execution so commands retire in submission order.
    execute_lock: Mutex<()>,
    pending: SegQueue<PendingCommand>,
    deferred_frees: SegQueue<DeviceAllocation>,
    submitted: AtomicCounter,
    completed: AtomicCounter,
    allocated: AtomicGauge,
}

impl std::fmt::Debug for HostDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostDevice")
            .field("capacity", &self.capacity)
            .field("immediate", &self.immediate)
            .field("stats", &self.stats())
            .finish()
    }
}

impl HostDevice {
    /// Create a device with 256 MB of memory that executes commands on `finish`/`wait`.
    pub fn new() -> Self {
        Self::with_capacity(mb(256))
    }

    /// Create a deferred-execution device with the given capacity in bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            limits: DeviceLimits {
                max_allocation_size: capacity,
                extensions: vec![EXTERNAL_MEMORY_HOST],
            },
            capacity,
            immediate: false,
            allocations: Mutex::new(HashMap::new()),
            next_id: AtomicCounter::new(0),
            submit_lock: Mutex::new(()),
            execute_lock: Mutex::new(()),
            pending: SegQueue::new(),
            deferred_frees: SegQueue::new(),
            submitted: AtomicCounter::new(0),
            completed: AtomicCounter::new(0),
            allocated: AtomicGauge::new(),
        }
    }

    /// Create a device that executes every command as soon as it is submitted.
    pub fn immediate() -> Self {
        Self {
            immediate: true,
            ..Self::new()
        }
    }

    /// Replace the advertised extension list.
    pub fn with_extensions(mut self, extensions: Vec<&'static str>) -> Self {
        self.limits.extensions = extensions;
        self
    }

    /// Execute every pending command and retire deferred frees.
    pub fn finish(&self) -> Result<(), DeviceError> {
        let _exec = self.execute_lock.lock();
        let mut result = Ok(());
        while let Some(pending) = self.pending.pop() {
            if let Err(err) = self.execute(&pending.command) {
                crate::dm_emit!(DM303, "{} at serial {}: {}", pending.command.name(), pending.serial.0, err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
            self.completed.advance_to(pending.serial.0);
        }
        self.collect_garbage();
        result
    }

    /// Copy an allocation's current contents out. Test and debugging helper.
    pub fn read_allocation(&self, allocation: &DeviceAllocation) -> Result<Vec<u8>, DeviceError> {
        let allocations = self.allocations.lock();
        let record = allocations
            .get(&allocation.id())
            .ok_or(DeviceError::UnknownAllocation(allocation.id()))?;
        let mut out = vec![0u8; record.size];
        unsafe {
            ptr::copy_nonoverlapping(record.base.as_ptr(), out.as_mut_ptr(), record.size);
        }
        Ok(out)
    }

    /// Whether the allocation is still live (not yet released).
    pub fn is_live(&self, allocation: &DeviceAllocation) -> bool {
        self.allocations.lock().contains_key(&allocation.id())
    }

    /// Outstanding map calls on an allocation.
    pub fn map_count(&self, allocation: &DeviceAllocation) -> u32 {
        self.allocations
            .lock()
            .get(&allocation.id())
            .map_or(0, |record| record.map_count)
    }

    /// Snapshot the device statistics.
    pub fn stats(&self) -> HostDeviceStats {
        let allocations = self.allocations.lock();
        HostDeviceStats {
            allocated_bytes: self.allocated.get(),
            peak_bytes: self.allocated.peak(),
            live_allocations: allocations.len(),
            mapped_allocations: allocations.values().filter(|a| a.map_count > 0).count(),
            pending_commands: self.pending.len(),
            deferred_frees: self.deferred_frees.len(),
            submitted: Serial(self.submitted.get()),
            completed: Serial(self.completed.get()),
        }
    }

    fn release(&self, allocation: &DeviceAllocation) {
        let removed = self.allocations.lock().remove(&allocation.id());
        if let Some(record) = removed {
            if record.map_count > 0 {
                crate::dm_emit!(DM301, "allocation {} had {} outstanding maps", allocation.id(), record.map_count);
            }
            self.allocated.sub(record.size);
        }
    }

    fn collect_garbage(&self) {
        let mut still_busy = Vec::new();
        while let Some(allocation) = self.deferred_frees.pop() {
            if self.has_resource_use_finished(allocation.resource_use()) {
                self.release(&allocation);
            } else {
                still_busy.push(allocation);
            }
        }
        for allocation in still_busy {
            self.deferred_frees.push(allocation);
        }
    }

    fn execute(&self, command: &DeviceCommand) -> Result<(), DeviceError> {
        let allocations = self.allocations.lock();
        let get = |alloc: &DeviceAllocation| lookup(&allocations, alloc);

        match command {
            DeviceCommand::CopyBuffer { src, dst, src_offset, dst_offset, size } => {
                let (s, d) = (get(src)?, get(dst)?);
                check_range(s, *src_offset, *size)?;
                check_range(d, *dst_offset, *size)?;
                // ptr::copy tolerates overlap when src and dst share an allocation.
                unsafe {
                    ptr::copy(
                        s.base.as_ptr().add(*src_offset),
                        d.base.as_ptr().add(*dst_offset),
                        *size,
                    );
                }
            }
            DeviceCommand::FillBuffer { dst, offset, size, pattern } => {
                let d = get(dst)?;
                check_range(d, *offset, *size)?;
                if pattern.is_empty() || size % pattern.len() != 0 {
                    return Err(DeviceError::InvalidCommand("fill size is not a multiple of the pattern"));
                }
                for chunk in 0..size / pattern.len() {
                    unsafe {
                        ptr::copy_nonoverlapping(
                            pattern.as_ptr(),
                            d.base.as_ptr().add(offset + chunk * pattern.len()),
                            pattern.len(),
                        );
                    }
                }
            }
            DeviceCommand::CopyBufferToImage { src, dst, region } => {
                let (buffer, image) = (get(src)?, get(dst)?);
                copy_buffer_image(buffer, image, region, true)?;
            }
            DeviceCommand::CopyImageToBuffer { src, dst, region } => {
                let (image, buffer) = (get(src)?, get(dst)?);
                copy_buffer_image(buffer, image, region, false)?;
            }
            DeviceCommand::CopyImage { src, dst, region } => {
                let (s, d) = (get(src)?, get(dst)?);
                copy_image_image(s, d, region)?;
            }
        }
        Ok(())
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for HostDevice {
    fn allocate(&self, request: &AllocationRequest) -> Result<DeviceAllocation, DeviceError> {
        if request.size > self.limits.max_allocation_size {
            return Err(DeviceError::AllocationTooLarge {
                requested: request.size,
                limit: self.limits.max_allocation_size,
            });
        }
        self.allocated
            .try_add(request.size, self.capacity)
            .map_err(|in_use| DeviceError::OutOfDeviceMemory {
                requested: request.size,
                available: self.capacity.saturating_sub(in_use),
            })?;

        let record = match HostAllocation::new(request) {
            Ok(record) => record,
            Err(err) => {
                self.allocated.sub(request.size);
                return Err(err);
            }
        };
        let id = AllocationId(self.next_id.next());
        self.allocations.lock().insert(id, record);

        crate::dm_trace!("allocate {} ({} bytes, {:?})", id, request.size, request.properties);
        Ok(DeviceAllocation::new(id, request.size, request.properties))
    }

    fn free(&self, allocation: &DeviceAllocation) {
        if self.has_resource_use_finished(allocation.resource_use()) {
            self.release(allocation);
        } else {
            crate::dm_emit!(DM302, "allocation {} waits for serial {}", allocation.id(), allocation.resource_use().serial().0);
            self.deferred_frees.push(allocation.clone());
        }
    }

    fn map(&self, allocation: &DeviceAllocation) -> Result<NonNull<u8>, DeviceError> {
        let mut allocations = self.allocations.lock();
        let record = allocations
            .get_mut(&allocation.id())
            .ok_or(DeviceError::UnknownAllocation(allocation.id()))?;
        if !record.properties.contains(MemoryProperties::HOST_VISIBLE) {
            return Err(DeviceError::NotHostVisible(allocation.id()));
        }
        record.map_count += 1;
        Ok(record.base)
    }

    fn unmap(&self, allocation: &DeviceAllocation) {
        if let Some(record) = self.allocations.lock().get_mut(&allocation.id()) {
            record.map_count = record.map_count.saturating_sub(1);
        }
    }

    fn submit(&self, command: DeviceCommand) -> Result<Serial, DeviceError> {
        let serial = {
            let _submit = self.submit_lock.lock();
            let serial = Serial(self.submitted.next());
            for allocation in command.allocations() {
                allocation.resource_use().record(serial);
            }
            crate::dm_trace!("submit {} at serial {}", command.name(), serial.0);
            self.pending.push(PendingCommand { serial, command });
            serial
        };

        if self.immediate {
            self.finish()?;
        }
        Ok(serial)
    }

    fn wait(&self, serial: Serial) -> Result<(), DeviceError> {
        if serial.0 <= self.completed.get() {
            return Ok(());
        }
        self.finish()
    }

    fn has_resource_use_finished(&self, resource_use: &ResourceUse) -> bool {
        resource_use.serial().0 <= self.completed.get()
    }

    fn limits(&self) -> &DeviceLimits {
        &self.limits
    }
}

fn lookup<'a>(
    allocations: &'a HashMap<AllocationId, HostAllocation>,
    allocation: &DeviceAllocation,
) -> Result<&'a HostAllocation, DeviceError> {
    allocations
        .get(&allocation.id())
        .ok_or(DeviceError::UnknownAllocation(allocation.id()))
}

fn check_range(record: &HostAllocation, offset: usize, size: usize) -> Result<(), DeviceError> {
    match offset.checked_add(size) {
        Some(end) if end <= record.size => Ok(()),
        _ => Err(DeviceError::InvalidCommand("range exceeds allocation")),
    }
}

/// Byte offset of texel (x, y, z) in `layer` of a tightly packed image allocation.
fn texel_offset(info: &ImageAllocationInfo, layer: u32, x: u32, y: u32, z: u32) -> usize {
    let e = &info.extent;
    let slice = layer as usize * e.depth as usize + z as usize;
    ((slice * e.height as usize + y as usize) * e.width as usize + x as usize) * info.element_size
}

/// The `(layer, z)` addressed by the `index`th 2D slice of a copy. Array images walk
/// layers, everything else walks depth.
fn slice_coords(sub: &ImageSubresourceLayers, offset: &Offset3D, index: u32) -> (u32, u32) {
    if sub.layer_count > 1 {
        (sub.base_array_layer + index, offset.z as u32)
    } else {
        (sub.base_array_layer, offset.z as u32 + index)
    }
}

fn check_image_region(
    info: &ImageAllocationInfo,
    sub: &ImageSubresourceLayers,
    offset: &Offset3D,
    extent: &Extent3D,
    slices: u32,
) -> Result<(), DeviceError> {
    if offset.x < 0 || offset.y < 0 || offset.z < 0 {
        return Err(DeviceError::InvalidCommand("negative image offset"));
    }
    // Widened so out-of-range commands cannot wrap.
    let last = u64::from(slices.saturating_sub(1));
    let (last_layer, last_z) = if sub.layer_count > 1 {
        (u64::from(sub.base_array_layer) + last, offset.z as u64)
    } else {
        (u64::from(sub.base_array_layer), offset.z as u64 + last)
    };
    let fits = offset.x as u64 + u64::from(extent.width) <= u64::from(info.extent.width)
        && offset.y as u64 + u64::from(extent.height) <= u64::from(info.extent.height)
        && last_z < u64::from(info.extent.depth)
        && last_layer < u64::from(info.array_layers);
    if fits {
        Ok(())
    } else {
        Err(DeviceError::InvalidCommand("image region exceeds image extent"))
    }
}

fn copy_buffer_image(
    buffer: &HostAllocation,
    image: &HostAllocation,
    region: &BufferImageCopy,
    to_image: bool,
) -> Result<(), DeviceError> {
    let info = image.image_info()?;
    let extent = region.image_extent;
    let slices = region
        .subresource
        .layer_count
        .max(1)
        .checked_mul(extent.depth)
        .ok_or(DeviceError::InvalidCommand("image region exceeds image extent"))?;
    check_image_region(info, &region.subresource, &region.image_offset, &extent, slices)?;

    let overflow = DeviceError::InvalidCommand("buffer region overflows");
    let row_texels = if region.buffer_row_length == 0 { extent.width } else { region.buffer_row_length };
    let image_rows = if region.buffer_image_height == 0 { extent.height } else { region.buffer_image_height };
    let row_pitch = (row_texels as usize).checked_mul(info.element_size).ok_or(overflow.clone())?;
    let slice_pitch = (image_rows as usize).checked_mul(row_pitch).ok_or(overflow.clone())?;
    let row_bytes = extent.width as usize * info.element_size;
    let span = crate::util::layout::pitched_span(
        row_bytes,
        extent.height as usize,
        slices as usize,
        row_pitch,
        slice_pitch,
    )
    .ok_or(overflow)?;
    check_range(buffer, region.buffer_offset, span)?;

    let origin = region.image_offset;
    for slice in 0..slices {
        let (layer, z) = slice_coords(&region.subresource, &origin, slice);
        for row in 0..extent.height {
            let buffer_at = region.buffer_offset + slice as usize * slice_pitch + row as usize * row_pitch;
            let image_at = texel_offset(info, layer, origin.x as u32, origin.y as u32 + row, z);
            unsafe {
                let (from, to) = if to_image {
                    (buffer.base.as_ptr().add(buffer_at), image.base.as_ptr().add(image_at))
                } else {
                    (image.base.as_ptr().add(image_at), buffer.base.as_ptr().add(buffer_at))
                };
                ptr::copy_nonoverlapping(from, to, row_bytes);
            }
        }
    }
    Ok(())
}

fn copy_image_image(src: &HostAllocation, dst: &HostAllocation, region: &ImageCopy) -> Result<(), DeviceError> {
    let (src_info, dst_info) = (src.image_info()?, dst.image_info()?);
    if src_info.element_size != dst_info.element_size {
        return Err(DeviceError::InvalidCommand("image element sizes differ"));
    }
    let slices = region
        .src_subresource
        .layer_count
        .max(region.dst_subresource.layer_count)
        .max(region.extent.depth);
    check_image_region(src_info, &region.src_subresource, &region.src_offset, &region.extent, slices)?;
    check_image_region(dst_info, &region.dst_subresource, &region.dst_offset, &region.extent, slices)?;

    let row_bytes = region.extent.width as usize * src_info.element_size;
    for slice in 0..slices {
        let (src_layer, src_z) = slice_coords(&region.src_subresource, &region.src_offset, slice);
        let (dst_layer, dst_z) = slice_coords(&region.dst_subresource, &region.dst_offset, slice);
        for row in 0..region.extent.height {
            let from = texel_offset(
                src_info,
                src_layer,
                region.src_offset.x as u32,
                region.src_offset.y as u32 + row,
                src_z,
            );
            let to = texel_offset(
                dst_info,
                dst_layer,
                region.dst_offset.x as u32,
                region.dst_offset.y as u32 + row,
                dst_z,
            );
            // ptr::copy: src and dst may be the same image.
            unsafe {
                ptr::copy(src.base.as_ptr().add(from), dst.base.as_ptr().add(to), row_bytes);
            }
        }
    }
    Ok(())
}
