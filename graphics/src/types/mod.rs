//! Common types and descriptors for graphics resources.
//!
//! This module contains usage flags, memory properties and descriptor
//! structs used throughout the graphics system.

mod buffer;
mod command;
mod descriptor;

pub use buffer::{
    BufferDescriptor, BufferUsage, CopyRegion, MemoryProperties, MemoryRequirements, SharingMode,
};
pub use command::{CommandBufferLevel, PipelineStage, QueueKind};
pub use descriptor::{DescriptorBinding, DescriptorPoolSize, DescriptorSetLayout, DescriptorType};
