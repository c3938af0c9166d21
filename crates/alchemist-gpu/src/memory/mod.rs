//! GPU memory management.
//!
//! Device memory is handed out in large [`DeviceMemoryBlock`]s, each of which
//! serves a single [`ResourceKind`] and is carved back-to-back into aligned
//! [`Bind`]s. The [`MemoryAllocatorRegistry`] owns every block of a device and
//! routes requests to them by [`Handle`](alchemist_core::Handle).

mod block;
mod device;
mod registry;

#[cfg(test)]
pub(crate) mod mock;

pub use block::{Bind, BlockDesc, DeviceMemoryBlock};
pub use device::MemoryDevice;
pub use registry::{KindReport, MemoryAllocatorRegistry, MemoryReport, RegistryConfig};

use ash::prelude::VkResult;
use ash::vk;

/// The two disjoint categories of resource a block can back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Image,
}

/// A raw resource handle together with its kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundResource {
    Buffer(vk::Buffer),
    Image(vk::Image),
}

impl BoundResource {
    /// Kind of the wrapped resource.
    #[must_use]
    pub const fn kind(self) -> ResourceKind {
        match self {
            Self::Buffer(_) => ResourceKind::Buffer,
            Self::Image(_) => ResourceKind::Image,
        }
    }

    /// Attach the resource to `memory` at `offset`.
    ///
    /// # Safety
    /// The resource and memory must be valid objects of `device`.
    pub(crate) unsafe fn bind<D: MemoryDevice + ?Sized>(
        self,
        device: &D,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> VkResult<()> {
        match self {
            Self::Buffer(buffer) => unsafe { device.bind_buffer_memory(buffer, memory, offset) },
            Self::Image(image) => unsafe { device.bind_image_memory(image, memory, offset) },
        }
    }
}

impl From<vk::Buffer> for BoundResource {
    fn from(buffer: vk::Buffer) -> Self {
        Self::Buffer(buffer)
    }
}

impl From<vk::Image> for BoundResource {
    fn from(image: vk::Image) -> Self {
        Self::Image(image)
    }
}

/// What a resource needs from the memory it is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirement {
    /// Size in bytes.
    pub size: vk::DeviceSize,
    /// Required alignment in bytes (0 is treated as 1).
    pub alignment: vk::DeviceSize,
    /// Bitmask of acceptable memory type indices.
    pub memory_type_bits: u32,
}

impl MemoryRequirement {
    /// Create a requirement.
    #[must_use]
    pub const fn new(size: vk::DeviceSize, alignment: vk::DeviceSize, memory_type_bits: u32) -> Self {
        Self {
            size,
            alignment,
            memory_type_bits,
        }
    }

    /// `size` rounded up to `alignment`, or `None` on overflow.
    #[must_use]
    pub fn aligned_size(&self) -> Option<vk::DeviceSize> {
        align_up(self.size, self.alignment)
    }

    /// Whether memory type `index` is acceptable.
    #[must_use]
    pub const fn accepts_type(&self, index: u32) -> bool {
        index < u32::BITS && (self.memory_type_bits & (1 << index)) != 0
    }
}

impl From<vk::MemoryRequirements> for MemoryRequirement {
    fn from(requirements: vk::MemoryRequirements) -> Self {
        Self::new(
            requirements.size,
            requirements.alignment,
            requirements.memory_type_bits,
        )
    }
}

/// Round `value` up to a multiple of `alignment`. Returns `None` on overflow.
#[must_use]
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> Option<vk::DeviceSize> {
    value.checked_next_multiple_of(alignment.max(1))
}

/// How a block resizes when a bind does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GrowthPolicy {
    /// Multiply capacity by the smallest integer factor `k >= 2` that fits.
    #[default]
    Linear,
    /// Double capacity until it fits.
    Geometric,
}

impl GrowthPolicy {
    /// Capacity after growing a block of `capacity` bytes so that `required`
    /// bytes fit. Returns `None` if the capacity is zero or would overflow.
    #[must_use]
    pub fn grown_capacity(
        self,
        capacity: vk::DeviceSize,
        required: vk::DeviceSize,
    ) -> Option<vk::DeviceSize> {
        if capacity == 0 {
            return None;
        }

        match self {
            Self::Linear => {
                let factor = required.div_ceil(capacity).max(2);
                capacity.checked_mul(factor)
            }
            Self::Geometric => {
                let mut grown = capacity.checked_mul(2)?;
                while grown < required {
                    grown = grown.checked_mul(2)?;
                }
                Some(grown)
            }
        }
    }
}

/// Which bytes of a block a mapping covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapRange {
    /// Everything handed out so far: `[0, consumed)`.
    Consumed,
    /// The whole allocation: `[0, capacity)`.
    Whole,
    /// Exactly the bytes of one bind.
    Bind(alchemist_core::Handle),
}

/// Find the first memory type allowed by `type_bits` whose flags contain `flags`.
#[must_use]
pub fn find_memory_type_index(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    let count = (memory_properties.memory_type_count as usize).min(vk::MAX_MEMORY_TYPES);

    memory_properties.memory_types[..count]
        .iter()
        .enumerate()
        .find(|(index, memory_type)| {
            (1u32 << index) & type_bits != 0 && memory_type.property_flags.contains(flags)
        })
        .map(|(index, _)| index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::mock::{host_flags, memory_properties};

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(600, 16), Some(608));
        assert_eq!(align_up(608, 16), Some(608));
        assert_eq!(align_up(0, 256), Some(0));
        assert_eq!(align_up(5, 0), Some(5));
        assert_eq!(align_up(u64::MAX, 16), None);
    }

    #[test]
    fn linear_growth_picks_smallest_factor() {
        // Fits at 2x.
        assert_eq!(GrowthPolicy::Linear.grown_capacity(1024, 1216), Some(2048));
        // Needs 3x.
        assert_eq!(GrowthPolicy::Linear.grown_capacity(1024, 2049), Some(3072));
        // Exactly 5x.
        assert_eq!(GrowthPolicy::Linear.grown_capacity(100, 500), Some(500));
    }

    #[test]
    fn geometric_growth_doubles_until_fit() {
        assert_eq!(GrowthPolicy::Geometric.grown_capacity(1024, 1216), Some(2048));
        assert_eq!(GrowthPolicy::Geometric.grown_capacity(1024, 2049), Some(4096));
        assert_eq!(GrowthPolicy::Geometric.grown_capacity(100, 500), Some(800));
    }

    #[test]
    fn growth_of_empty_or_huge_block_fails() {
        assert_eq!(GrowthPolicy::Linear.grown_capacity(0, 10), None);
        assert_eq!(GrowthPolicy::Geometric.grown_capacity(0, 10), None);
        assert_eq!(GrowthPolicy::Geometric.grown_capacity(u64::MAX / 2 + 1, u64::MAX), None);
    }

    #[test]
    fn requirement_type_bits() {
        let requirement = MemoryRequirement::new(64, 16, 0b101);
        assert!(requirement.accepts_type(0));
        assert!(!requirement.accepts_type(1));
        assert!(requirement.accepts_type(2));
        assert!(!requirement.accepts_type(40));
    }

    #[test]
    fn memory_type_search_honours_mask_and_flags() {
        let properties = memory_properties();
        let host = host_flags();

        assert_eq!(find_memory_type_index(&properties, 0b111, host), Some(1));
        assert_eq!(find_memory_type_index(&properties, 0b101, host), Some(2));
        assert_eq!(
            find_memory_type_index(&properties, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL),
            Some(0)
        );
        assert_eq!(find_memory_type_index(&properties, 0b001, host), None);
        // Bits past memory_type_count are ignored.
        assert_eq!(find_memory_type_index(&properties, 0b1000, vk::MemoryPropertyFlags::empty()), None);
    }
}
