//! Buffers and images backed by the memory registry.

use crate::context::ResourceContext;
use crate::error::{GpuError, Result};
use crate::memory::{BoundResource, MapRange, MemoryDevice, MemoryRequirement};
use alchemist_core::Handle;
use ash::vk;

/// A buffer placed in a registry block.
#[derive(Debug)]
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    /// Handle of tag `buffer`.
    pub handle: Handle,
    /// Block holding the buffer's memory.
    pub block: Handle,
    /// Bind inside `block`.
    pub bind: Handle,
    pub size: u64,
}

impl GpuBuffer {
    /// Create a buffer and place it in the first block with `properties`.
    ///
    /// # Safety
    /// `device` must be the device `resources` was created for.
    pub unsafe fn create(
        device: &ash::Device,
        resources: &mut ResourceContext,
        size: u64,
        usage: vk::BufferUsageFlags,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None) }.map_err(GpuError::from)?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let (block, bind) = match resources.memory_mut().bind_best(
            &MemoryRequirement::from(requirements),
            properties,
            BoundResource::Buffer(buffer),
        ) {
            Ok(placed) => placed,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let buffer_type = resources.atlas().buffer;
        let handle = resources.handles().lock().allocate(buffer_type);

        Ok(Self {
            buffer,
            handle,
            block,
            bind,
            size,
        })
    }

    /// Write raw bytes at `offset` (buffer must be host-visible).
    pub fn write_bytes<D: MemoryDevice>(
        &self,
        resources: &mut ResourceContext<D>,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| GpuError::InvalidState("Offset overflow".to_string()))?;
        if end > self.size {
            return Err(GpuError::InvalidState(
                "Data range too large for buffer".to_string(),
            ));
        }

        resources
            .memory_mut()
            .write_bytes(self.block, MapRange::Bind(self.bind), offset, data)
    }

    /// Write typed data at the start of the buffer (must be host-visible).
    pub fn write<T: bytemuck::Pod, D: MemoryDevice>(
        &self,
        resources: &mut ResourceContext<D>,
        data: &[T],
    ) -> Result<()> {
        self.write_bytes(resources, 0, bytemuck::cast_slice(data))
    }

    /// Read `len` bytes at `offset` (buffer must be host-visible).
    pub fn read_bytes<D: MemoryDevice>(
        &self,
        resources: &mut ResourceContext<D>,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>> {
        resources
            .memory_mut()
            .read_bytes(self.block, MapRange::Bind(self.bind), offset, len)
    }

    /// Destroy the buffer object.
    ///
    /// The memory stays in its block until the block is freed.
    ///
    /// # Safety
    /// The buffer must no longer be in use by the GPU.
    pub unsafe fn destroy(&mut self, device: &ash::Device, resources: &ResourceContext) {
        if self.buffer == vk::Buffer::null() {
            return;
        }

        unsafe { device.destroy_buffer(self.buffer, None) };
        self.buffer = vk::Buffer::null();

        let buffer_type = resources.atlas().buffer;
        resources.handles().lock().free(buffer_type, self.handle);
        self.handle = Handle::INVALID;
    }
}

/// An image placed in a registry block.
#[derive(Debug)]
pub struct GpuImage {
    pub image: vk::Image,
    /// Handle of tag `image`.
    pub handle: Handle,
    pub block: Handle,
    pub bind: Handle,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
}

impl GpuImage {
    /// Create an image and place it in the first block with `properties`.
    ///
    /// # Safety
    /// `device` must be the device `resources` was created for.
    pub unsafe fn create(
        device: &ash::Device,
        resources: &mut ResourceContext,
        create_info: &vk::ImageCreateInfo,
        properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let image = unsafe { device.create_image(create_info, None) }.map_err(GpuError::from)?;

        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let (block, bind) = match resources.memory_mut().bind_best(
            &MemoryRequirement::from(requirements),
            properties,
            BoundResource::Image(image),
        ) {
            Ok(placed) => placed,
            Err(e) => {
                unsafe { device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let image_type = resources.atlas().image;
        let handle = resources.handles().lock().allocate(image_type);

        Ok(Self {
            image,
            handle,
            block,
            bind,
            format: create_info.format,
            extent: create_info.extent,
        })
    }

    /// Destroy the image object.
    ///
    /// # Safety
    /// The image must no longer be in use by the GPU.
    pub unsafe fn destroy(&mut self, device: &ash::Device, resources: &ResourceContext) {
        if self.image == vk::Image::null() {
            return;
        }

        unsafe { device.destroy_image(self.image, None) };
        self.image = vk::Image::null();

        let image_type = resources.atlas().image;
        resources.handles().lock().free(image_type, self.handle);
        self.handle = Handle::INVALID;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mock::{self, MockDevice};
    use crate::memory::{RegistryConfig, ResourceKind};
    use std::sync::Arc;

    /// A buffer of `size` bytes placed by hand, since the mock cannot create raw buffers.
    fn placed_buffer(resources: &mut ResourceContext<MockDevice>, size: u64) -> GpuBuffer {
        let raw = mock::buffer(1);
        let (block, bind) = resources
            .memory_mut()
            .bind_best(
                &MemoryRequirement::new(size, 16, 0b010),
                mock::host_flags(),
                BoundResource::Buffer(raw),
            )
            .unwrap();
        let buffer_type = resources.atlas().buffer;
        let handle = resources.handles().lock().allocate(buffer_type);

        GpuBuffer {
            buffer: raw,
            handle,
            block,
            bind,
            size,
        }
    }

    fn resources() -> ResourceContext<MockDevice> {
        unsafe {
            ResourceContext::new(
                Arc::new(MockDevice::new()),
                mock::memory_properties(),
                RegistryConfig::default().with_block_size(256),
            )
        }
    }

    #[test]
    fn typed_write_lands_in_the_bind() {
        let mut resources = resources();
        let _first = placed_buffer(&mut resources, 20);
        let buffer = placed_buffer(&mut resources, 16);

        let words: [u32; 4] = [0x0102_0304, 5, 6, 0xFFFF_FFFF];
        buffer.write(&mut resources, &words).unwrap();

        let read = buffer.read_bytes(&mut resources, 0, 16).unwrap();
        assert_eq!(read, bytemuck::cast_slice::<u32, u8>(&words));

        // The first buffer's bytes are untouched.
        let block = resources.memory().blocks(ResourceKind::Buffer)[0].handle();
        let head = resources
            .memory_mut()
            .read_bytes(block, MapRange::Consumed, 0, 32)
            .unwrap();
        assert!(head.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_past_buffer_size_is_rejected() {
        let mut resources = resources();
        let buffer = placed_buffer(&mut resources, 8);

        let result = buffer.write(&mut resources, &[1u32, 2, 3]);
        assert!(matches!(result, Err(GpuError::InvalidState(_))));

        buffer.write_bytes(&mut resources, 4, &[9u8; 4]).unwrap();
        assert_eq!(buffer.read_bytes(&mut resources, 4, 4).unwrap(), vec![9u8; 4]);
    }
}
