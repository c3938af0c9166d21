//! Core types for the Alchemist engine.
//!
//! This crate provides the foundational pieces shared by every server:
//! - Opaque, type-scoped resource handles
//! - The handle allocator that issues and recycles them
//! - Common error types

pub mod error;
pub mod handle;

pub use error::{Error, Result};
pub use handle::{Handle, HandleAllocator, HandleAtlas, HandleType, SharedHandleAllocator};
