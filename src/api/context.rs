//! Object arena.
//!
//! `MemoryContext` owns every buffer and image created through it and hands out
//! generational handles. Sub-buffers record their parent's handle; releasing a parent
//! releases its views alongside it.

use std::sync::Arc;

use super::config::MemConfig;
use super::handles::{Arena, BufferHandle, ImageHandle};
use crate::error::{MemError, MemResult};
use crate::format::ImageFormat;
use crate::gpu::Device;
use crate::memory::{BufferObject, ImageDescriptor, ImageObject, MemFlags, MemoryObject};
use crate::sync::mutex::Mutex;

/// Counts of live objects in a context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    pub buffers: usize,
    pub sub_buffers: usize,
    pub images: usize,
}

/// Owner of memory objects created on one device.
///
/// Objects are reference counted: a caller holding an `Arc` from [`buffer`](Self::buffer)
/// keeps the object alive after release, but its handle is stale from then on.
pub struct MemoryContext {
    device: Arc<dyn Device>,
    config: MemConfig,
    buffers: Mutex<Arena<BufferObject>>,
    images: Mutex<Arena<ImageObject>>,
}

impl std::fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryContext")
            .field("device", &self.device)
            .field("stats", &self.stats())
            .finish()
    }
}

impl MemoryContext {
    pub fn new(device: Arc<dyn Device>, config: MemConfig) -> Self {
        Self {
            device,
            config,
            buffers: Mutex::new(Arena::new()),
            images: Mutex::new(Arena::new()),
        }
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn config(&self) -> &MemConfig {
        &self.config
    }

    /// Create a buffer. See [`BufferObject::create`].
    pub fn create_buffer(&self, flags: MemFlags, size: usize, host: Option<&[u8]>) -> MemResult<BufferHandle> {
        let buffer = BufferObject::create(self.device.clone(), &self.config, flags, size, host)?;
        Ok(self.buffers.lock().insert(buffer))
    }

    /// Create a view of `size` bytes at `offset` into `parent`.
    pub fn create_sub_buffer(
        &self,
        parent: BufferHandle,
        flags: MemFlags,
        offset: usize,
        size: usize,
    ) -> MemResult<BufferHandle> {
        let mut buffers = self.buffers.lock();
        let mut view = buffers.get(parent)?.create_sub_buffer(flags, offset, size)?;
        view.set_parent(parent);
        Ok(buffers.insert(view))
    }

    /// Create an image. See [`ImageObject::create`].
    pub fn create_image(
        &self,
        flags: MemFlags,
        format: ImageFormat,
        desc: ImageDescriptor,
        host: Option<&[u8]>,
    ) -> MemResult<ImageHandle> {
        let image = ImageObject::create(self.device.clone(), &self.config, flags, format, desc, host)?;
        Ok(self.images.lock().insert(image))
    }

    pub fn buffer(&self, handle: BufferHandle) -> MemResult<Arc<BufferObject>> {
        self.buffers.lock().get(handle).cloned()
    }

    pub fn image(&self, handle: ImageHandle) -> MemResult<Arc<ImageObject>> {
        self.images.lock().get(handle).cloned()
    }

    /// Live sub-buffers created from `parent`.
    pub fn sub_buffers(&self, parent: BufferHandle) -> Vec<BufferHandle> {
        self.buffers
            .lock()
            .iter()
            .filter(|(_, buffer)| buffer.parent() == Some(parent))
            .map(|(handle, _)| handle)
            .collect()
    }

    /// Release a buffer and every sub-buffer created from it.
    ///
    /// Fails without releasing anything while the buffer or one of its views is mapped.
    pub fn release_buffer(&self, handle: BufferHandle) -> MemResult<()> {
        let mut buffers = self.buffers.lock();
        let buffer = buffers.get(handle)?;
        let views: Vec<BufferHandle> = buffers
            .iter()
            .filter(|(_, view)| view.parent() == Some(handle))
            .map(|(view, _)| view)
            .collect();

        let mapped = buffer.map_count()
            + views
                .iter()
                .filter_map(|view| buffers.get(*view).ok())
                .map(|view| view.map_count())
                .sum::<u32>();
        if mapped > 0 {
            crate::dm_emit!(DM002, "buffer {:?} has {} outstanding maps", handle, mapped);
            return Err(MemError::InvalidState("buffer is mapped"));
        }

        if !views.is_empty() {
            crate::dm_emit!(DM201, "buffer {:?} released with {} sub-buffers", handle, views.len());
        }
        for view in views {
            buffers.remove(view)?;
        }
        buffers.remove(handle)?;
        crate::dm_trace!("buffer {:?} released", handle);
        Ok(())
    }

    /// Release an image. Fails while it is mapped.
    pub fn release_image(&self, handle: ImageHandle) -> MemResult<()> {
        let mut images = self.images.lock();
        let image = images.get(handle)?;
        if image.is_mapped() {
            crate::dm_emit!(DM002, "image {:?} has {} outstanding maps", handle, image.map_count());
            return Err(MemError::InvalidState("image is mapped"));
        }
        images.remove(handle)?;
        crate::dm_trace!("image {:?} released", handle);
        Ok(())
    }

    pub fn stats(&self) -> ContextStats {
        let buffers = self.buffers.lock();
        let sub_buffers = buffers.iter().filter(|(_, b)| b.is_sub_buffer()).count();
        ContextStats {
            buffers: buffers.len() - sub_buffers,
            sub_buffers,
            images: self.images.lock().len(),
        }
    }
}
