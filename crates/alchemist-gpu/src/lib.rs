//! Vulkan memory layer for the Alchemist engine.
//!
//! This crate provides:
//! - Slab sub-allocation of `VkDeviceMemory` blocks with growth and bind migration
//! - A handle-indexed registry of buffer and image memory blocks
//! - The per-device resource context that replaces global servers
//! - Headless device bring-up and buffer/image helpers on top of the registry

pub mod context;
pub mod error;
pub mod instance;
pub mod memory;
pub mod resource;

pub use context::{GpuContext, GpuContextBuilder, ResourceContext};
pub use error::{GpuError, Result};
pub use memory::{
    Bind, BoundResource, DeviceMemoryBlock, GrowthPolicy, KindReport, MapRange, MemoryAllocatorRegistry,
    MemoryDevice, MemoryReport, MemoryRequirement, RegistryConfig, ResourceKind,
};
pub use resource::{GpuBuffer, GpuImage};
