//! A single device-memory allocation, linearly sub-allocated.

use std::ptr::NonNull;

use alchemist_core::{Handle, HandleAllocator, HandleAtlas, HandleType};
use ash::vk;
use tracing::{debug, warn};

use super::{BoundResource, GrowthPolicy, MapRange, MemoryDevice, MemoryRequirement, ResourceKind};
use crate::error::{GpuError, Result};

/// One sub-allocation inside a [`DeviceMemoryBlock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bind {
    resource: BoundResource,
    offset: vk::DeviceSize,
    size: vk::DeviceSize,
    handle: Handle,
}

impl Bind {
    /// The resource backed by this bind.
    #[must_use]
    pub const fn resource(&self) -> BoundResource {
        self.resource
    }

    /// Byte offset within the block.
    #[must_use]
    pub const fn offset(&self) -> vk::DeviceSize {
        self.offset
    }

    /// Aligned size in bytes.
    #[must_use]
    pub const fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Handle of this bind.
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.handle
    }
}

/// Parameters for a new block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDesc {
    pub kind: ResourceKind,
    pub capacity: vk::DeviceSize,
    pub memory_type_index: u32,
    pub properties: vk::MemoryPropertyFlags,
    pub growth: GrowthPolicy,
}

/// One real GPU memory allocation carved back-to-back into [`Bind`]s.
///
/// Binds are placed in call order starting at offset 0 and are never
/// reclaimed individually. When a bind does not fit, the block reallocates
/// according to its [`GrowthPolicy`] and moves every existing bind to the new
/// memory at its old offset.
///
/// Any pointer returned by [`map`](Self::map) is invalidated by growth; the
/// block refuses to grow while mapped.
#[derive(Debug)]
pub struct DeviceMemoryBlock {
    memory: vk::DeviceMemory,
    kind: ResourceKind,
    memory_type_index: u32,
    properties: vk::MemoryPropertyFlags,
    capacity: vk::DeviceSize,
    consumed: vk::DeviceSize,
    growth: GrowthPolicy,
    binds: Vec<Bind>,
    handle: Handle,
    mapped: bool,
}

impl DeviceMemoryBlock {
    /// Allocate the device memory for a new block.
    pub(crate) fn create<D: MemoryDevice + ?Sized>(
        device: &D,
        handle: Handle,
        desc: &BlockDesc,
    ) -> Result<Self> {
        if desc.capacity == 0 {
            return Err(GpuError::AllocationFailed(
                "memory block capacity must be non-zero".to_string(),
            ));
        }

        let memory = unsafe { device.allocate_memory(desc.capacity, desc.memory_type_index) }
            .map_err(|e| {
                GpuError::AllocationFailed(format!(
                    "{} bytes of memory type {}: {e}",
                    desc.capacity, desc.memory_type_index
                ))
            })?;

        debug!(
            "Allocated memory block {handle} ({:?}) of {} bytes, type {}",
            desc.kind, desc.capacity, desc.memory_type_index
        );

        Ok(Self {
            memory,
            kind: desc.kind,
            memory_type_index: desc.memory_type_index,
            properties: desc.properties,
            capacity: desc.capacity,
            consumed: 0,
            growth: desc.growth,
            binds: Vec::new(),
            handle,
            mapped: false,
        })
    }

    /// Handle of this block.
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.handle
    }

    /// The underlying memory object. Changes when the block grows.
    #[must_use]
    pub const fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Which kind of resource this block backs.
    #[must_use]
    pub const fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// Memory type index of the allocation.
    #[must_use]
    pub const fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    /// Memory property flags of the allocation.
    #[must_use]
    pub const fn properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    /// Total size of the allocation in bytes.
    #[must_use]
    pub const fn capacity(&self) -> vk::DeviceSize {
        self.capacity
    }

    /// Bytes handed out to binds so far.
    #[must_use]
    pub const fn consumed(&self) -> vk::DeviceSize {
        self.consumed
    }

    /// Growth policy chosen at creation.
    #[must_use]
    pub const fn growth(&self) -> GrowthPolicy {
        self.growth
    }

    /// All binds in placement order.
    #[must_use]
    pub fn binds(&self) -> &[Bind] {
        &self.binds
    }

    /// Look up a bind by handle.
    #[must_use]
    pub fn get_bind(&self, handle: Handle) -> Option<&Bind> {
        self.binds.iter().find(|bind| bind.handle == handle)
    }

    /// Whether the block is currently mapped.
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// Whether the host can map this block.
    #[must_use]
    pub fn is_host_visible(&self) -> bool {
        self.properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Whether the block's memory type is set in `memory_type_bits`.
    #[must_use]
    pub const fn is_compatible(&self, memory_type_bits: u32) -> bool {
        self.memory_type_index < u32::BITS
            && (memory_type_bits & (1 << self.memory_type_index)) != 0
    }

    /// Whether the block has every flag in `wanted`.
    #[must_use]
    pub fn satisfies(&self, wanted: vk::MemoryPropertyFlags) -> bool {
        self.properties.contains(wanted)
    }

    /// Place `resource` after the last bind, growing the block if needed.
    ///
    /// Callers normally pick a compatible block first, but the resource kind
    /// and memory type mask are checked again here and a mismatch is reported
    /// as [`GpuError::IncompatibleMemory`].
    pub(crate) fn bind<D: MemoryDevice + ?Sized>(
        &mut self,
        device: &D,
        handles: &mut HandleAllocator,
        bind_type: HandleType,
        requirement: &MemoryRequirement,
        resource: BoundResource,
    ) -> Result<Handle> {
        if resource.kind() != self.kind {
            return Err(GpuError::IncompatibleMemory(format!(
                "{:?} cannot be placed in {:?} block {}",
                resource.kind(),
                self.kind,
                self.handle
            )));
        }

        if !self.is_compatible(requirement.memory_type_bits) {
            return Err(GpuError::IncompatibleMemory(format!(
                "memory type {} of block {} not in mask {:#b}",
                self.memory_type_index, self.handle, requirement.memory_type_bits
            )));
        }

        let required = requirement
            .aligned_size()
            .and_then(|aligned| self.consumed.checked_add(aligned))
            .ok_or_else(|| {
                GpuError::BindFailed(format!("size {} overflows block {}", requirement.size, self.handle))
            })?;
        let offset = self.consumed;
        let size = required - offset;

        if required > self.capacity {
            self.grow(device, required).map_err(|e| {
                GpuError::BindFailed(format!("block {} could not grow: {e}", self.handle))
            })?;
        }

        let handle = handles.try_allocate(bind_type)?;

        if let Err(e) = unsafe { resource.bind(device, self.memory, offset) } {
            handles.free(bind_type, handle);
            return Err(GpuError::BindFailed(format!(
                "{resource:?} at offset {offset} of block {}: {e}",
                self.handle
            )));
        }

        self.binds.push(Bind {
            resource,
            offset,
            size,
            handle,
        });
        self.consumed = required;

        debug!(
            "Bound {resource:?} to block {} at offset {offset} ({size} bytes, bind {handle})",
            self.handle
        );

        Ok(handle)
    }

    /// Reallocate so that `required` bytes fit, moving every bind across.
    fn grow<D: MemoryDevice + ?Sized>(&mut self, device: &D, required: vk::DeviceSize) -> Result<()> {
        if self.mapped {
            return Err(GpuError::InvalidState(format!(
                "block {} cannot grow while mapped",
                self.handle
            )));
        }

        let capacity = self
            .growth
            .grown_capacity(self.capacity, required)
            .ok_or_else(|| {
                GpuError::AllocationFailed(format!(
                    "cannot grow {} bytes to fit {required}",
                    self.capacity
                ))
            })?;

        let memory = unsafe { device.allocate_memory(capacity, self.memory_type_index) }
            .map_err(|e| GpuError::AllocationFailed(format!("{capacity} bytes: {e}")))?;

        if let Err(e) = self.migrate(device, memory) {
            unsafe { device.free_memory(memory) };
            return Err(e);
        }

        unsafe { device.free_memory(self.memory) };

        debug!(
            "Grew memory block {} from {} to {capacity} bytes ({:?})",
            self.handle, self.capacity, self.growth
        );

        self.memory = memory;
        self.capacity = capacity;
        Ok(())
    }

    /// Copy host-visible contents into `target` and rebind every resource to it.
    ///
    /// On failure every resource is back on the current memory.
    fn migrate<D: MemoryDevice + ?Sized>(&self, device: &D, target: vk::DeviceMemory) -> Result<()> {
        if self.is_host_visible() && self.consumed > 0 {
            let len = usize::try_from(self.consumed)
                .map_err(|_| GpuError::Other("block too large to copy".to_string()))?;

            unsafe {
                let src = device.map_memory(self.memory, 0, self.consumed)?;
                let dst = match device.map_memory(target, 0, self.consumed) {
                    Ok(dst) => dst,
                    Err(e) => {
                        device.unmap_memory(self.memory);
                        return Err(e.into());
                    }
                };
                std::ptr::copy_nonoverlapping(src, dst, len);
                device.unmap_memory(target);
                device.unmap_memory(self.memory);
            }
        }

        for (moved, bind) in self.binds.iter().enumerate() {
            if let Err(e) = unsafe { bind.resource.bind(device, target, bind.offset) } {
                // Put the binds already moved back on the memory that stays alive.
                for restored in &self.binds[..moved] {
                    if let Err(undo) = unsafe { restored.resource.bind(device, self.memory, restored.offset) } {
                        warn!(
                            "Failed to restore {:?} to memory block {}: {undo}",
                            restored.resource, self.handle
                        );
                    }
                }
                return Err(e.into());
            }
        }

        Ok(())
    }

    /// Byte range `(offset, size)` covered by `range`.
    fn resolve(&self, range: MapRange) -> Result<(vk::DeviceSize, vk::DeviceSize)> {
        match range {
            MapRange::Consumed => Ok((0, self.consumed)),
            MapRange::Whole => Ok((0, self.capacity)),
            MapRange::Bind(handle) => self
                .get_bind(handle)
                .map(|bind| (bind.offset, bind.size))
                .ok_or_else(|| {
                    GpuError::ResourceNotFound(format!("bind {handle} in block {}", self.handle))
                }),
        }
    }

    /// Map `range` into host memory.
    ///
    /// Only one mapping may be live at a time; call [`unmap`](Self::unmap)
    /// before mapping again or binding anything that could grow the block.
    pub(crate) fn map<D: MemoryDevice + ?Sized>(
        &mut self,
        device: &D,
        range: MapRange,
    ) -> Result<NonNull<u8>> {
        if !self.is_host_visible() {
            warn!("Cannot map memory block {}, not host visible", self.handle);
            return Err(GpuError::NotHostVisible(self.handle));
        }

        if self.mapped {
            return Err(GpuError::InvalidState(format!(
                "block {} is already mapped",
                self.handle
            )));
        }

        let (offset, size) = self.resolve(range)?;
        if size == 0 {
            return Err(GpuError::InvalidState(format!(
                "nothing to map in block {}",
                self.handle
            )));
        }

        let ptr = unsafe { device.map_memory(self.memory, offset, size) }?;
        let Some(ptr) = NonNull::new(ptr) else {
            unsafe { device.unmap_memory(self.memory) };
            return Err(GpuError::Other(format!(
                "mapping block {} returned null",
                self.handle
            )));
        };

        self.mapped = true;
        Ok(ptr)
    }

    /// Release the current mapping.
    pub(crate) fn unmap<D: MemoryDevice + ?Sized>(&mut self, device: &D) {
        if !self.is_host_visible() {
            warn!("Cannot unmap memory block {}, not host visible", self.handle);
            return;
        }

        if !self.mapped {
            warn!("Memory block {} is not mapped", self.handle);
            return;
        }

        unsafe { device.unmap_memory(self.memory) };
        self.mapped = false;
    }

    /// Copy `data` into `range` starting `offset` bytes in.
    pub(crate) fn write_bytes<D: MemoryDevice + ?Sized>(
        &mut self,
        device: &D,
        range: MapRange,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        let (_, size) = self.resolve(range)?;
        check_bounds(offset, data.len(), size)?;

        let start = host_offset(offset)?;
        let ptr = self.map(device, range)?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(start), data.len());
        }
        self.unmap(device);

        Ok(())
    }

    /// Read `len` bytes from `range` starting `offset` bytes in.
    pub(crate) fn read_bytes<D: MemoryDevice + ?Sized>(
        &mut self,
        device: &D,
        range: MapRange,
        offset: vk::DeviceSize,
        len: usize,
    ) -> Result<Vec<u8>> {
        let (_, size) = self.resolve(range)?;
        check_bounds(offset, len, size)?;

        let start = host_offset(offset)?;
        let ptr = self.map(device, range)?;
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(ptr.as_ptr().add(start), out.as_mut_ptr(), len);
        }
        self.unmap(device);

        Ok(out)
    }

    /// Free the device memory and return this block's handles to `handles`.
    pub(crate) fn release<D: MemoryDevice + ?Sized>(
        mut self,
        device: &D,
        handles: &mut HandleAllocator,
        atlas: &HandleAtlas,
    ) {
        if self.mapped {
            self.unmap(device);
        }

        unsafe { device.free_memory(self.memory) };

        for bind in self.binds.drain(..) {
            handles.free(atlas.bind, bind.handle);
        }
        handles.free(atlas.memory, self.handle);

        debug!("Freed memory block {} ({} bytes)", self.handle, self.capacity);
    }
}

fn check_bounds(offset: vk::DeviceSize, len: usize, size: vk::DeviceSize) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
    if end > size {
        return Err(GpuError::InvalidState(format!(
            "range {offset}..{end} exceeds mapped size {size}"
        )));
    }
    Ok(())
}

fn host_offset(offset: vk::DeviceSize) -> Result<usize> {
    usize::try_from(offset)
        .map_err(|_| GpuError::InvalidState(format!("offset {offset} exceeds host address space")))
}
