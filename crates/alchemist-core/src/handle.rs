//! Type-scoped resource handles and their allocator.
//!
//! Every server in the engine identifies its objects by a [`Handle`]: an
//! opaque `u64` that is only unique within one [`HandleType`]. The
//! [`HandleAllocator`] hands out fresh values per type and recycles freed
//! ones most-recently-freed first.
//!
//! Handles carry no generation counter. A value that was freed can be issued
//! again for the same type, so a stale copy becomes indistinguishable from
//! the new owner's handle. Callers must stop using a handle once freed.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Opaque identifier for a live object within a [`HandleType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(u64);

impl Handle {
    /// Reserved value meaning "no object".
    pub const INVALID: Self = Self(u64::MAX);

    /// Wrap a raw value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether this is anything other than [`Handle::INVALID`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != u64::MAX
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            f.write_str("#invalid")
        }
    }
}

/// Tag partitioning the handle namespace (memory blocks, binds, images, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleType(usize);

impl HandleType {
    /// Index of this tag inside its allocator.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Per-type bookkeeping: the next fresh value and the freed values.
#[derive(Debug, Default)]
struct Slot {
    next: u64,
    free: Vec<u64>,
}

/// Issues and recycles handle values per [`HandleType`].
#[derive(Debug, Default)]
pub struct HandleAllocator {
    slots: Vec<Slot>,
}

impl HandleAllocator {
    /// Create an allocator with no registered types.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new handle type. Its values start at 0.
    pub fn register_type(&mut self) -> HandleType {
        self.slots.push(Slot::default());
        HandleType(self.slots.len() - 1)
    }

    /// Number of registered types.
    #[must_use]
    pub fn type_count(&self) -> usize {
        self.slots.len()
    }

    /// Allocate a handle, reporting an unregistered type as an error.
    pub fn try_allocate(&mut self, ty: HandleType) -> Result<Handle> {
        let slot = self
            .slots
            .get_mut(ty.0)
            .ok_or(Error::UnknownHandleType(ty.0))?;

        // LIFO: the most recently freed value comes back first.
        if let Some(raw) = slot.free.pop() {
            return Ok(Handle(raw));
        }

        let raw = slot.next;
        slot.next += 1;
        Ok(Handle(raw))
    }

    /// Allocate a handle for `ty`.
    ///
    /// Returns [`Handle::INVALID`] if `ty` was never registered here.
    pub fn allocate(&mut self, ty: HandleType) -> Handle {
        self.try_allocate(ty).unwrap_or_else(|e| {
            tracing::warn!("Handle allocation failed: {e}");
            Handle::INVALID
        })
    }

    /// Return `handle` to the pool of `ty`.
    ///
    /// Values that were never issued are ignored with a warning. There is no
    /// liveness tracking: freeing the same live value twice queues it twice.
    pub fn free(&mut self, ty: HandleType, handle: Handle) {
        let Some(slot) = self.slots.get_mut(ty.0) else {
            tracing::warn!("Attempted to free {handle} for unknown type {}", ty.0);
            return;
        };

        if handle.0 < slot.next {
            slot.free.push(handle.0);
        } else {
            tracing::warn!("Attempted to free unissued handle {handle} for type {}", ty.0);
        }
    }

    /// How many distinct values have ever been issued for `ty`.
    #[must_use]
    pub fn issued(&self, ty: HandleType) -> u64 {
        self.slots.get(ty.0).map_or(0, |slot| slot.next)
    }

    /// How many freed values are waiting to be reused for `ty`.
    #[must_use]
    pub fn free_count(&self, ty: HandleType) -> usize {
        self.slots.get(ty.0).map_or(0, |slot| slot.free.len())
    }
}

/// Handle allocator shared between the servers of one device.
pub type SharedHandleAllocator = Arc<Mutex<HandleAllocator>>;

/// The handle types every device context registers up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandleAtlas {
    /// Device memory blocks.
    pub memory: HandleType,
    /// Sub-allocations inside a memory block.
    pub bind: HandleType,
    /// Buffers.
    pub buffer: HandleType,
    /// Images.
    pub image: HandleType,
}

impl HandleAtlas {
    /// Register the standard types on `allocator`.
    pub fn register(allocator: &mut HandleAllocator) -> Self {
        Self {
            memory: allocator.register_type(),
            bind: allocator.register_type(),
            buffer: allocator.register_type(),
            image: allocator.register_type(),
        }
    }
}
