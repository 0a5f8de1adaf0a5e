//! # Arbor Graphics
//!
//! GPU resource sub-allocation and the multi-buffered frame pipeline of the
//! arbor scene graph.
//!
//! ## Overview
//!
//! This crate provides:
//! - [`MemorySlots`] - offset/size bookkeeping for one arena
//! - [`MemoryBufferPools`] and [`DescriptorPools`] - arenas that grow on demand
//!   and hand out [`Lease`]s
//! - [`FramePipeline`] - N in-flight frames, each with its own fence, command
//!   buffer and semaphore
//! - [`TransferTask`] - staged uploads of CPU data that changed since the last
//!   upload
//! - Backends: Dummy (default, for tests) and Vulkan (`vulkan-backend` feature)
//!
//! ## Example
//!
//! ```
//! use arbor_graphics::{
//!     BufferUsage, DeviceParameters, FramePipeline, GraphicsDevice, MemoryProperties,
//!     PipelineParameters, SharingMode,
//! };
//!
//! let device = GraphicsDevice::new(DeviceParameters::new()).unwrap();
//! let vertices = device
//!     .reserve_buffer(4096, 16, BufferUsage::VERTEX, SharingMode::Exclusive, MemoryProperties::DEVICE_LOCAL)
//!     .unwrap();
//! assert_eq!(vertices.offset(), 0);
//!
//! let mut pipeline = FramePipeline::new(device, PipelineParameters::default()).unwrap();
//! pipeline.advance();
//! assert_eq!(pipeline.index(0), 0);
//! ```

pub mod backend;
pub mod command;
pub mod device;
pub mod error;
pub mod memory;
pub mod pipeline;
pub mod queue;
pub mod resources;
pub mod sync;
pub mod types;

// Re-export main types for convenience
pub use backend::{BackendKind, DummyBackend, DummyConfig};
pub use command::{CommandBuffer, CommandEncoder, RecordedCommandBuffers};
pub use device::{DeviceParameters, GraphicsDevice};
pub use error::GraphicsError;
pub use memory::{
    Arena, BufferLease, DescriptorPool, DescriptorPools, DescriptorSetLease, DynamicData, Lease,
    MemoryBufferPools, MemoryLease, MemorySlots, ResourcePreferences, ResourceRequirements,
};
pub use pipeline::{CommandRecorder, FramePipeline, PipelineParameters, TransferTask};
pub use queue::{Queue, Submission};
pub use resources::{Buffer, DeviceMemory};
pub use sync::{Fence, Semaphore};
pub use types::{
    BufferDescriptor, BufferUsage, CommandBufferLevel, CopyRegion, DescriptorBinding,
    DescriptorPoolSize, DescriptorSetLayout, DescriptorType, MemoryProperties,
    MemoryRequirements, PipelineStage, QueueKind, SharingMode,
};

/// Graphics library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the library version. Optional; nothing depends on it having run.
pub fn init() {
    log::info!("Arbor Graphics v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_dummy_backend() {
        let backend = DummyBackend::new();
        assert_eq!(backend.name(), "Dummy Backend");
    }
}
