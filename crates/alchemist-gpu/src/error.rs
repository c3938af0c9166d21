//! GPU error types.

use alchemist_core::Handle;
use ash::vk;
use thiserror::Error;

/// GPU-related errors.
#[derive(Error, Debug)]
pub enum GpuError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Device memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// A resource could not be placed in a memory block.
    #[error("Bind failed: {0}")]
    BindFailed(String),

    /// Memory type or properties do not satisfy the resource.
    #[error("Incompatible memory: {0}")]
    IncompatibleMemory(String),

    /// Attempted to map memory that is not host-visible.
    #[error("Memory block {0} is not host-visible")]
    NotHostVisible(Handle),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    /// Invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Handle bookkeeping error.
    #[error(transparent)]
    Handle(#[from] alchemist_core::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
