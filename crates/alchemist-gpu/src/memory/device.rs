//! The device-memory primitives the allocator is built on.

use ash::prelude::VkResult;
use ash::vk;

/// Raw device-memory operations.
///
/// Implemented for [`ash::Device`]. The allocator never retries a failed
/// primitive; it only reports the failure upward.
pub trait MemoryDevice {
    /// Allocate `size` bytes of memory type `memory_type_index`.
    ///
    /// # Safety
    /// The device must be valid.
    unsafe fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory>;

    /// Release a memory object.
    ///
    /// # Safety
    /// `memory` must come from this device, be unmapped by the caller's
    /// bookkeeping and no longer be in use by the GPU.
    unsafe fn free_memory(&self, memory: vk::DeviceMemory);

    /// Attach `buffer` to `memory` at `offset`.
    ///
    /// # Safety
    /// Both objects must come from this device.
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    /// Attach `image` to `memory` at `offset`.
    ///
    /// # Safety
    /// Both objects must come from this device.
    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()>;

    /// Map `[offset, offset + size)` of `memory` into the host address space.
    ///
    /// # Safety
    /// `memory` must be host-visible and not currently mapped.
    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut u8>;

    /// Release the current mapping of `memory`.
    ///
    /// # Safety
    /// `memory` must currently be mapped.
    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory);
}

impl MemoryDevice for ash::Device {
    unsafe fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type_index);

        unsafe { Self::allocate_memory(self, &alloc_info, None) }
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { Self::free_memory(self, memory, None) }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        unsafe { Self::bind_buffer_memory(self, buffer, memory, offset) }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        unsafe { Self::bind_image_memory(self, image, memory, offset) }
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut u8> {
        unsafe { Self::map_memory(self, memory, offset, size, vk::MemoryMapFlags::empty()) }
            .map(|ptr| ptr.cast::<u8>())
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        unsafe { Self::unmap_memory(self, memory) }
    }
}
