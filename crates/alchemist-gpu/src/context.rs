//! GPU context management.

use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::{MemoryAllocatorRegistry, MemoryDevice, RegistryConfig};
use alchemist_core::{HandleAllocator, HandleAtlas, SharedHandleAllocator};
use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

/// Per-device resource state: handle allocator and memory registry.
///
/// Created once per logical device and passed by reference to whatever
/// needs to create or look up resources.
pub struct ResourceContext<D: MemoryDevice = ash::Device> {
    handles: SharedHandleAllocator,
    atlas: HandleAtlas,
    memory: MemoryAllocatorRegistry<D>,
}

impl<D: MemoryDevice> ResourceContext<D> {
    /// Create a context with a fresh handle allocator.
    ///
    /// # Safety
    /// `device` must stay valid until the context is shut down or dropped,
    /// and `memory_properties` must describe its physical device.
    pub unsafe fn new(
        device: Arc<D>,
        memory_properties: vk::PhysicalDeviceMemoryProperties,
        config: RegistryConfig,
    ) -> Self {
        let mut allocator = HandleAllocator::new();
        let atlas = HandleAtlas::register(&mut allocator);
        let handles: SharedHandleAllocator = Arc::new(Mutex::new(allocator));

        let memory = unsafe {
            MemoryAllocatorRegistry::new(
                device,
                memory_properties,
                Arc::clone(&handles),
                atlas,
                config,
            )
        };

        Self {
            handles,
            atlas,
            memory,
        }
    }

    /// Shared handle allocator.
    pub const fn handles(&self) -> &SharedHandleAllocator {
        &self.handles
    }

    /// Handle types registered for this context.
    pub const fn atlas(&self) -> &HandleAtlas {
        &self.atlas
    }

    /// Memory registry.
    pub const fn memory(&self) -> &MemoryAllocatorRegistry<D> {
        &self.memory
    }

    /// Mutable memory registry.
    pub fn memory_mut(&mut self) -> &mut MemoryAllocatorRegistry<D> {
        &mut self.memory
    }

    /// Free all device memory. Must run before the device is destroyed.
    pub fn shutdown(&mut self) {
        self.memory.shutdown();
    }
}

/// Headless GPU context: device, one queue and the resource context.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) resources: Mutex<ResourceContext>,
    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the Vulkan instance handle.
    pub const fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Queue supporting transfer (and graphics or compute when available).
    pub const fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Family index of [`queue`](Self::queue).
    pub const fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Get access to the resource context.
    pub const fn resources(&self) -> &Mutex<ResourceContext> {
        &self.resources
    }

    /// Wait for device to be idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Free every VkDeviceMemory before the device goes away
            self.resources.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
    registry: RegistryConfig,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Alchemist".to_string(),
            enable_validation: cfg!(debug_assertions),
            registry: RegistryConfig::default(),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Configure the memory registry.
    #[must_use]
    pub const fn registry(mut self, config: RegistryConfig) -> Self {
        self.registry = config;
        self
    }

    /// Build the GPU context.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let physical_device = match unsafe { select_physical_device(&instance) } {
            Ok(physical_device) => physical_device,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        tracing::info!(
            "Selected GPU: {}",
            properties
                .device_name_as_c_str()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default()
        );

        let created = unsafe { find_queue_family(&instance, physical_device) }.and_then(
            |queue_family| {
                unsafe { create_device(&instance, physical_device, queue_family) }
                    .map(|(device, queue)| (device, queue_family, queue))
            },
        );
        let (device, queue_family, queue) = match created {
            Ok(created) => created,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(e);
            }
        };

        let device = Arc::new(device);

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let resources =
            unsafe { ResourceContext::new(Arc::clone(&device), memory_properties, self.registry) };

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            resources: Mutex::new(resources),
            queue_family,
            queue,
        })
    }
}

/// Find a queue family supporting transfer, preferring graphics, then compute.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    let find = |flags: vk::QueueFlags| {
        queue_families
            .iter()
            .position(|family| family.queue_flags.contains(flags))
            .map(|i| i as u32)
    };

    // Graphics and compute queues implicitly support transfer.
    find(vk::QueueFlags::GRAPHICS)
        .or_else(|| find(vk::QueueFlags::COMPUTE))
        .or_else(|| find(vk::QueueFlags::TRANSFER))
        .ok_or(GpuError::NoSuitableDevice)
}

/// Create the logical device and retrieve its queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let device_create_info =
        vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);

    let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
        .map_err(GpuError::from)?;

    let queue = unsafe { device.get_device_queue(queue_family, 0) };

    Ok((device, queue))
}
