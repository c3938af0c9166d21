//! In-memory stand-in for a Vulkan device, recording every primitive call.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use ash::prelude::VkResult;
use ash::vk::{self, Handle as _};

use super::MemoryDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Allocate {
        memory: vk::DeviceMemory,
        size: vk::DeviceSize,
        memory_type_index: u32,
    },
    Free(vk::DeviceMemory),
    BindBuffer {
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    },
    BindImage {
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    },
    Map {
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    },
    Unmap(vk::DeviceMemory),
}

#[derive(Default)]
pub struct MockDevice {
    next_memory: Cell<u64>,
    allocations: RefCell<HashMap<u64, Box<[u8]>>>,
    mapped: RefCell<Vec<u64>>,
    calls: RefCell<Vec<Call>>,
    fail_allocations: Cell<bool>,
    fail_binds: Cell<bool>,
    fail_bind_in: Cell<Option<usize>>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.borrow_mut().clear();
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.borrow().len()
    }

    pub fn is_live(&self, memory: vk::DeviceMemory) -> bool {
        self.allocations.borrow().contains_key(&memory.as_raw())
    }

    pub fn set_fail_allocations(&self, fail: bool) {
        self.fail_allocations.set(fail);
    }

    pub fn set_fail_binds(&self, fail: bool) {
        self.fail_binds.set(fail);
    }

    /// Let `n` more bind calls succeed, fail the next one, then succeed again.
    pub fn fail_bind_after(&self, n: usize) {
        self.fail_bind_in.set(Some(n));
    }

    fn bind_fails(&self) -> bool {
        if self.fail_binds.get() {
            return true;
        }
        match self.fail_bind_in.get() {
            Some(0) => {
                self.fail_bind_in.set(None);
                true
            }
            Some(n) => {
                self.fail_bind_in.set(Some(n - 1));
                false
            }
            None => false,
        }
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

impl MemoryDevice for MockDevice {
    unsafe fn allocate_memory(
        &self,
        size: vk::DeviceSize,
        memory_type_index: u32,
    ) -> VkResult<vk::DeviceMemory> {
        if self.fail_allocations.get() {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }

        // Raw value 0 is VK_NULL_HANDLE.
        let raw = self.next_memory.get() + 1;
        self.next_memory.set(raw);
        let memory = vk::DeviceMemory::from_raw(raw);

        let len = usize::try_from(size).map_err(|_| vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
        self.allocations
            .borrow_mut()
            .insert(raw, vec![0u8; len].into_boxed_slice());
        self.record(Call::Allocate {
            memory,
            size,
            memory_type_index,
        });
        Ok(memory)
    }

    unsafe fn free_memory(&self, memory: vk::DeviceMemory) {
        let removed = self.allocations.borrow_mut().remove(&memory.as_raw());
        assert!(removed.is_some(), "double free of {memory:?}");
        assert!(
            !self.mapped.borrow().contains(&memory.as_raw()),
            "freed {memory:?} while mapped"
        );
        self.record(Call::Free(memory));
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        if self.bind_fails() {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        assert!(self.is_live(memory), "bind to dead {memory:?}");
        self.record(Call::BindBuffer {
            buffer,
            memory,
            offset,
        });
        Ok(())
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        if self.bind_fails() {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        assert!(self.is_live(memory), "bind to dead {memory:?}");
        self.record(Call::BindImage {
            image,
            memory,
            offset,
        });
        Ok(())
    }

    unsafe fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> VkResult<*mut u8> {
        let raw = memory.as_raw();
        if self.mapped.borrow().contains(&raw) {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        let mut allocations = self.allocations.borrow_mut();
        let bytes = allocations
            .get_mut(&raw)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let end = offset
            .checked_add(size)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if end > bytes.len() as u64 {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }

        // The boxed slice never reallocates, so the pointer stays valid until free.
        let ptr = unsafe { bytes.as_mut_ptr().add(offset as usize) };
        drop(allocations);

        self.mapped.borrow_mut().push(raw);
        self.record(Call::Map {
            memory,
            offset,
            size,
        });
        Ok(ptr)
    }

    unsafe fn unmap_memory(&self, memory: vk::DeviceMemory) {
        let raw = memory.as_raw();
        let mut mapped = self.mapped.borrow_mut();
        let position = mapped.iter().position(|&m| m == raw);
        assert!(position.is_some(), "unmap of unmapped {memory:?}");
        if let Some(position) = position {
            mapped.swap_remove(position);
        }
        drop(mapped);
        self.record(Call::Unmap(memory));
    }
}

pub fn buffer(raw: u64) -> vk::Buffer {
    vk::Buffer::from_raw(raw)
}

pub fn image(raw: u64) -> vk::Image {
    vk::Image::from_raw(raw)
}

/// Memory types: 0 device-local, 1 host-visible|coherent, 2 all three.
pub fn memory_properties() -> vk::PhysicalDeviceMemoryProperties {
    let mut properties = vk::PhysicalDeviceMemoryProperties {
        memory_type_count: 3,
        ..Default::default()
    };
    properties.memory_types[0].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;
    properties.memory_types[1].property_flags = host_flags();
    properties.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL | host_flags();
    properties
}

pub fn host_flags() -> vk::MemoryPropertyFlags {
    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
}
