//! Generational handles for memory objects.
//!
//! A handle names a slot in an [`Arena`] plus the generation the slot had when the
//! object was inserted. Releasing an object bumps the generation, so stale handles are
//! rejected instead of silently aliasing a newer object.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{MemError, MemResult};
use crate::memory::{BufferObject, ImageObject};

/// Generation counter for handle validation.
type Generation = u32;

/// A stable handle to an object stored in an [`Arena`].
pub struct Handle<T> {
    index: u32,
    generation: Generation,
    _marker: PhantomData<fn() -> T>,
}

/// Handle of a buffer or sub-buffer.
pub type BufferHandle = Handle<BufferObject>;

/// Handle of an image.
pub type ImageHandle = Handle<ImageObject>;

// Manual implementations to avoid bounds on T
impl<T> Copy for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.generation == other.generation
    }
}

impl<T> Eq for Handle<T> {}

impl<T> std::hash::Hash for Handle<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

impl<T> Handle<T> {
    /// Create a dangling handle (for default initialization).
    pub const fn dangling() -> Self {
        Self {
            index: u32::MAX,
            generation: 0,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Handle<T> {
    fn default() -> Self {
        Self::dangling()
    }
}

/// Internal slot for tracking objects.
struct Slot<T> {
    value: Option<Arc<T>>,
    generation: Generation,
}

/// Slot storage indexed by [`Handle`]s. Freed slots are reused with a new generation.
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    free_list: Vec<u32>,
    live: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            live: 0,
        }
    }

    /// Store `value` and return its handle.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        let value = Some(Arc::new(value));
        self.live += 1;
        if let Some(index) = self.free_list.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation = slot.generation.wrapping_add(1);
            slot.value = value;
            Handle {
                index,
                generation: slot.generation,
                _marker: PhantomData,
            }
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { value, generation: 0 });
            Handle {
                index,
                generation: 0,
                _marker: PhantomData,
            }
        }
    }

    fn slot(&self, handle: Handle<T>) -> Option<&Slot<T>> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation && slot.value.is_some())
    }

    /// Resolve a handle, rejecting stale or foreign ones.
    pub fn get(&self, handle: Handle<T>) -> MemResult<&Arc<T>> {
        self.slot(handle)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(MemError::InvalidHandle)
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.slot(handle).is_some()
    }

    /// Take the object out of the arena. The slot's next occupant gets a new generation.
    pub fn remove(&mut self, handle: Handle<T>) -> MemResult<Arc<T>> {
        if !self.contains(handle) {
            return Err(MemError::InvalidHandle);
        }
        let value = self.slots[handle.index as usize]
            .value
            .take()
            .ok_or(MemError::InvalidHandle)?;
        self.free_list.push(handle.index);
        self.live -= 1;
        Ok(value)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Handles and objects of every live slot.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &Arc<T>)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.value.as_ref().map(|value| {
                (
                    Handle {
                        index: index as u32,
                        generation: slot.generation,
                        _marker: PhantomData,
                    },
                    value,
                )
            })
        })
    }
}
