//! Handle-indexed registry of device-memory blocks.

use std::ptr::NonNull;
use std::sync::Arc;

use alchemist_core::{Handle, HandleAtlas, SharedHandleAllocator};
use ash::vk;
use tracing::{debug, warn};

use super::{
    find_memory_type_index, BlockDesc, BoundResource, DeviceMemoryBlock, GrowthPolicy, MapRange,
    MemoryDevice, MemoryRequirement, ResourceKind,
};
use crate::error::{GpuError, Result};

/// Registry configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Capacity of blocks created on demand by [`MemoryAllocatorRegistry::bind_best`].
    pub default_block_size: vk::DeviceSize,
    /// Growth policy of blocks created without an explicit one.
    pub growth: GrowthPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_block_size: 1024 * 1024,
            growth: GrowthPolicy::Linear,
        }
    }
}

impl RegistryConfig {
    /// Set the on-demand block size.
    #[must_use]
    pub const fn with_block_size(mut self, size: vk::DeviceSize) -> Self {
        self.default_block_size = size;
        self
    }

    /// Set the default growth policy.
    #[must_use]
    pub const fn with_growth(mut self, growth: GrowthPolicy) -> Self {
        self.growth = growth;
        self
    }
}

/// Totals for one kind of block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindReport {
    pub blocks: usize,
    pub binds: usize,
    pub capacity: vk::DeviceSize,
    pub consumed: vk::DeviceSize,
}

/// Memory usage summary of a registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryReport {
    pub buffers: KindReport,
    pub images: KindReport,
}

impl KindReport {
    fn from_blocks(blocks: &[DeviceMemoryBlock]) -> Self {
        blocks.iter().fold(Self::default(), |acc, block| Self {
            blocks: acc.blocks + 1,
            binds: acc.binds + block.binds().len(),
            capacity: acc.capacity + block.capacity(),
            consumed: acc.consumed + block.consumed(),
        })
    }
}

/// Owns every device-memory block of one logical device.
///
/// Buffer memory and image memory live in separate collections. Blocks are
/// found by linear scan. All operations are fail-soft: a lookup miss yields
/// an error, `None` or `false` and is logged, never a panic.
pub struct MemoryAllocatorRegistry<D: MemoryDevice = ash::Device> {
    device: Arc<D>,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    handles: SharedHandleAllocator,
    atlas: HandleAtlas,
    config: RegistryConfig,
    buffer_blocks: Vec<DeviceMemoryBlock>,
    image_blocks: Vec<DeviceMemoryBlock>,
}

impl<D: MemoryDevice> MemoryAllocatorRegistry<D> {
    /// Create an empty registry.
    ///
    /// # Safety
    /// `device` must stay valid until the registry is shut down or dropped,
    /// and `memory_properties` must describe its physical device.
    pub unsafe fn new(
        device: Arc<D>,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        handles: SharedHandleAllocator,
        atlas: HandleAtlas,
        config: RegistryConfig,
    ) -> Self {
        Self {
            device,
            memory_properties,
            handles,
            atlas,
            config,
            buffer_blocks: Vec::new(),
            image_blocks: Vec::new(),
        }
    }

    /// The device the registry allocates from.
    pub fn device(&self) -> &D {
        &self.device
    }

    /// Registry configuration.
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Memory properties of the physical device.
    pub const fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn blocks_mut(&mut self, kind: ResourceKind) -> &mut Vec<DeviceMemoryBlock> {
        match kind {
            ResourceKind::Buffer => &mut self.buffer_blocks,
            ResourceKind::Image => &mut self.image_blocks,
        }
    }

    /// All blocks of `kind` in creation order.
    pub fn blocks(&self, kind: ResourceKind) -> &[DeviceMemoryBlock] {
        match kind {
            ResourceKind::Buffer => &self.buffer_blocks,
            ResourceKind::Image => &self.image_blocks,
        }
    }

    /// Look up a block in either collection.
    pub fn block(&self, handle: Handle) -> Option<&DeviceMemoryBlock> {
        self.buffer_blocks
            .iter()
            .chain(&self.image_blocks)
            .find(|block| block.handle() == handle)
    }

    fn block_mut(&mut self, handle: Handle) -> Result<&mut DeviceMemoryBlock> {
        self.buffer_blocks
            .iter_mut()
            .chain(&mut self.image_blocks)
            .find(|block| block.handle() == handle)
            .ok_or_else(|| {
                warn!("Memory block {handle} not found");
                GpuError::ResourceNotFound(format!("memory block {handle}"))
            })
    }

    /// First memory type allowed by `type_bits` that has every flag in `properties`.
    pub fn find_memory_type(&self, type_bits: u32, properties: vk::MemoryPropertyFlags) -> Option<u32> {
        find_memory_type_index(&self.memory_properties, type_bits, properties)
    }

    /// Allocate a new block using the configured growth policy.
    pub fn allocate_block(
        &mut self,
        kind: ResourceKind,
        capacity: vk::DeviceSize,
        properties: vk::MemoryPropertyFlags,
        memory_type_index: u32,
    ) -> Result<Handle> {
        let growth = self.config.growth;
        self.allocate_block_with(kind, capacity, properties, memory_type_index, growth)
    }

    /// Allocate a new block with an explicit growth policy.
    pub fn allocate_block_with(
        &mut self,
        kind: ResourceKind,
        capacity: vk::DeviceSize,
        properties: vk::MemoryPropertyFlags,
        memory_type_index: u32,
        growth: GrowthPolicy,
    ) -> Result<Handle> {
        if memory_type_index >= self.memory_properties.memory_type_count {
            return Err(GpuError::IncompatibleMemory(format!(
                "memory type {memory_type_index} does not exist (device has {})",
                self.memory_properties.memory_type_count
            )));
        }

        let mut handles = self.handles.lock();
        let handle = handles.try_allocate(self.atlas.memory)?;

        let desc = BlockDesc {
            kind,
            capacity,
            memory_type_index,
            properties,
            growth,
        };
        let block = match DeviceMemoryBlock::create(&*self.device, handle, &desc) {
            Ok(block) => block,
            Err(e) => {
                handles.free(self.atlas.memory, handle);
                return Err(e);
            }
        };
        drop(handles);

        self.blocks_mut(kind).push(block);
        Ok(handle)
    }

    /// Free a block and its device memory. Unknown handles are ignored.
    pub fn free_block(&mut self, handle: Handle) {
        let block = [ResourceKind::Buffer, ResourceKind::Image]
            .into_iter()
            .find_map(|kind| {
                let blocks = self.blocks_mut(kind);
                let index = blocks.iter().position(|block| block.handle() == handle)?;
                Some(blocks.remove(index))
            });

        match block {
            Some(block) => block.release(&*self.device, &mut self.handles.lock(), &self.atlas),
            None => warn!("Failed to free memory block {handle}: not found"),
        }
    }

    /// First block of `kind` whose memory type is allowed by `requirement`
    /// and whose properties include every flag in `properties`.
    ///
    /// Never creates a block; see [`bind_best`](Self::bind_best) for that.
    pub fn find_best(
        &self,
        kind: ResourceKind,
        requirement: &MemoryRequirement,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<Handle> {
        self.blocks(kind)
            .iter()
            .find(|block| {
                block.is_compatible(requirement.memory_type_bits) && block.satisfies(properties)
            })
            .map(DeviceMemoryBlock::handle)
    }

    /// Place `resource` in block `block`, growing it if needed.
    ///
    /// The block is looked up among blocks of the resource's kind only.
    pub fn bind(
        &mut self,
        block: Handle,
        requirement: &MemoryRequirement,
        resource: BoundResource,
    ) -> Result<Handle> {
        let device = Arc::clone(&self.device);
        let handles = Arc::clone(&self.handles);
        let bind_type = self.atlas.bind;

        let kind = resource.kind();
        let target = self
            .blocks_mut(kind)
            .iter_mut()
            .find(|candidate| candidate.handle() == block)
            .ok_or_else(|| {
                warn!("{kind:?} memory block {block} not found");
                GpuError::ResourceNotFound(format!("{kind:?} memory block {block}"))
            })?;
        let mut handles = handles.lock();
        target.bind(&*device, &mut handles, bind_type, requirement, resource)
    }

    /// Place `resource` in the first suitable block, creating one if none fits.
    ///
    /// New blocks get the larger of the configured block size and the
    /// resource's aligned size. Returns `(block, bind)`.
    pub fn bind_best(
        &mut self,
        requirement: &MemoryRequirement,
        properties: vk::MemoryPropertyFlags,
        resource: BoundResource,
    ) -> Result<(Handle, Handle)> {
        let kind = resource.kind();

        let block = if let Some(block) = self.find_best(kind, requirement, properties) {
            block
        } else {
            let memory_type_index = self
                .find_memory_type(requirement.memory_type_bits, properties)
                .ok_or_else(|| {
                    GpuError::IncompatibleMemory(format!(
                        "no memory type in {:#b} with {properties:?}",
                        requirement.memory_type_bits
                    ))
                })?;
            let aligned = requirement.aligned_size().ok_or_else(|| {
                GpuError::AllocationFailed(format!("size {} overflows", requirement.size))
            })?;
            let capacity = aligned.max(self.config.default_block_size);

            // Record what the memory type really offers, not just what was asked for.
            let actual = self.memory_properties.memory_types[memory_type_index as usize].property_flags;
            self.allocate_block(kind, capacity, actual, memory_type_index)?
        };

        let bind = self.bind(block, requirement, resource)?;
        debug!("Bound {resource:?} to best block {block} (bind {bind})");
        Ok((block, bind))
    }

    /// Map a range of block `block` into host memory.
    ///
    /// Do not hold the pointer across a [`bind`](Self::bind) into the same block.
    pub fn map(&mut self, block: Handle, range: MapRange) -> Result<NonNull<u8>> {
        let device = Arc::clone(&self.device);
        self.block_mut(block)?.map(&*device, range)
    }

    /// Release the mapping of block `block`.
    pub fn unmap(&mut self, block: Handle) {
        let device = Arc::clone(&self.device);
        match self.block_mut(block) {
            Ok(target) => target.unmap(&*device),
            Err(_) => warn!("Failed to unmap memory block {block}"),
        }
    }

    /// Copy `data` into `range` of block `block`, starting `offset` bytes in.
    pub fn write_bytes(
        &mut self,
        block: Handle,
        range: MapRange,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<()> {
        let device = Arc::clone(&self.device);
        self.block_mut(block)?
            .write_bytes(&*device, range, offset, data)
    }

    /// Read `len` bytes from `range` of block `block`, starting `offset` bytes in.
    pub fn read_bytes(
        &mut self,
        block: Handle,
        range: MapRange,
        offset: vk::DeviceSize,
        len: usize,
    ) -> Result<Vec<u8>> {
        let device = Arc::clone(&self.device);
        self.block_mut(block)?.read_bytes(&*device, range, offset, len)
    }

    /// Whether block `block` exists and accepts the memory types of `requirement`.
    pub fn is_valid(&self, block: Handle, requirement: &MemoryRequirement) -> bool {
        self.block(block)
            .is_some_and(|block| block.is_compatible(requirement.memory_type_bits))
    }

    /// Usage summary.
    pub fn report(&self) -> MemoryReport {
        MemoryReport {
            buffers: KindReport::from_blocks(&self.buffer_blocks),
            images: KindReport::from_blocks(&self.image_blocks),
        }
    }

    /// Free every block.
    ///
    /// Must be called before the device is destroyed.
    pub fn shutdown(&mut self) {
        if self.buffer_blocks.is_empty() && self.image_blocks.is_empty() {
            return;
        }

        let mut handles = self.handles.lock();
        for block in self.buffer_blocks.drain(..).chain(self.image_blocks.drain(..)) {
            block.release(&*self.device, &mut handles, &self.atlas);
        }
    }
}

impl<D: MemoryDevice> Drop for MemoryAllocatorRegistry<D> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
