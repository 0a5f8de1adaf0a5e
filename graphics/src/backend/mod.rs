//! GPU backend abstraction layer.
//!
//! Every GPU object is a tagged enum with one variant per backend, and
//! [`GpuBackend`] itself is an enum over the backend implementations. Hot
//! paths match on the variant instead of going through a vtable.
//!
//! # Available Backends
//!
//! - `dummy` (default): a stub GPU that keeps host shadows of memory,
//!   executes copies at submit time and signals fences after a configurable
//!   latency. Used for tests and headless development.
//! - `vulkan-backend`: native Vulkan using ash and gpu-allocator.

pub mod dummy;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "vulkan-backend")]
use ash::vk;

use crate::error::GraphicsError;
use crate::types::{
    BufferDescriptor, CommandBufferLevel, CopyRegion, DescriptorPoolSize, DescriptorSetLayout,
    MemoryProperties, MemoryRequirements, PipelineStage, QueueKind,
};

pub use dummy::{DummyBackend, DummyConfig, RecordedCommand, SubmissionRecord};

/// Backend selection for device creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Stub GPU, always available.
    #[default]
    Dummy,
    /// Native Vulkan.
    Vulkan,
}

/// A GPU backend.
#[allow(clippy::large_enum_variant)]
pub enum GpuBackend {
    Dummy(DummyBackend),
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vulkan::VulkanBackend),
}

impl std::fmt::Debug for GpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(backend) => f.debug_tuple("GpuBackend::Dummy").field(backend).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => f.debug_tuple("GpuBackend::Vulkan").field(backend).finish(),
        }
    }
}

/// One queue submission.
pub struct SubmitInfo<'a> {
    /// Primary command buffers, executed in order.
    pub command_buffers: &'a [&'a GpuCommandBuffer],
    /// Semaphores to wait on and the stage at which each wait applies.
    pub wait_semaphores: &'a [(&'a GpuSemaphore, PipelineStage)],
    /// Semaphores signaled when the command buffers complete.
    pub signal_semaphores: &'a [&'a GpuSemaphore],
    /// Fence signaled when the command buffers complete.
    pub fence: Option<&'a GpuFence>,
}

impl GpuBackend {
    /// Create a backend of the requested kind.
    pub fn new(kind: BackendKind, validation: bool) -> Result<Self, GraphicsError> {
        match kind {
            BackendKind::Dummy => Ok(Self::Dummy(DummyBackend::new())),
            #[cfg(feature = "vulkan-backend")]
            BackendKind::Vulkan => Ok(Self::Vulkan(vulkan::VulkanBackend::new(validation)?)),
            #[cfg(not(feature = "vulkan-backend"))]
            BackendKind::Vulkan => {
                let _ = validation;
                Err(GraphicsError::InitializationFailed(
                    "Vulkan backend not compiled in (enable the `vulkan-backend` feature)"
                        .to_string(),
                ))
            }
        }
    }

    /// Get the backend name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dummy(backend) => backend.name(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => backend.name(),
        }
    }

    /// The stub backend, if this is one.
    pub fn as_dummy(&self) -> Option<&DummyBackend> {
        match self {
            Self::Dummy(backend) => Some(backend),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(_) => None,
        }
    }

    /// Create an unbound buffer.
    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError> {
        match self {
            Self::Dummy(backend) => backend.create_buffer(descriptor),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => backend.create_buffer(descriptor),
        }
    }

    /// Memory requirements of a buffer.
    pub fn buffer_memory_requirements(&self, buffer: &GpuBuffer) -> MemoryRequirements {
        match self {
            Self::Dummy(backend) => backend.buffer_memory_requirements(buffer),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => backend.buffer_memory_requirements(buffer),
        }
    }

    /// Allocate one device memory block of `requirements.size` bytes.
    pub fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        properties: MemoryProperties,
    ) -> Result<GpuMemory, GraphicsError> {
        match self {
            Self::Dummy(backend) => backend.allocate_memory(requirements, properties),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => backend.allocate_memory(requirements, properties),
        }
    }

    /// Bind a buffer to `memory` at `offset` bytes into the block.
    pub fn bind_buffer_memory(
        &self,
        buffer: &GpuBuffer,
        memory: &GpuMemory,
        offset: u64,
    ) -> Result<(), GraphicsError> {
        match self {
            Self::Dummy(backend) => backend.bind_buffer_memory(buffer, memory, offset),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => backend.bind_buffer_memory(buffer, memory, offset),
        }
    }

    /// Create a descriptor pool.
    pub fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[DescriptorPoolSize],
    ) -> Result<GpuDescriptorPool, GraphicsError> {
        match self {
            Self::Dummy(backend) => backend.create_descriptor_pool(max_sets, pool_sizes),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => backend.create_descriptor_pool(max_sets, pool_sizes),
        }
    }

    /// Allocate a descriptor set from a pool.
    pub fn allocate_descriptor_set(
        &self,
        pool: &GpuDescriptorPool,
        layout: &DescriptorSetLayout,
    ) -> Result<GpuDescriptorSet, GraphicsError> {
        match self {
            Self::Dummy(backend) => backend.allocate_descriptor_set(pool, layout),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => backend.allocate_descriptor_set(pool, layout),
        }
    }

    /// Create a fence, optionally already signaled.
    pub fn create_fence(&self, signaled: bool) -> Result<GpuFence, GraphicsError> {
        match self {
            Self::Dummy(backend) => backend.create_fence(signaled),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => backend.create_fence(signaled),
        }
    }

    /// Create a binary semaphore.
    pub fn create_semaphore(&self) -> Result<GpuSemaphore, GraphicsError> {
        match self {
            Self::Dummy(backend) => backend.create_semaphore(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => backend.create_semaphore(),
        }
    }

    /// Create a command buffer for the given queue.
    pub fn create_command_buffer(
        &self,
        queue: QueueKind,
        level: CommandBufferLevel,
    ) -> Result<GpuCommandBuffer, GraphicsError> {
        match self {
            Self::Dummy(backend) => backend.create_command_buffer(queue, level),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => backend.create_command_buffer(queue, level),
        }
    }

    /// Submit work to a queue.
    ///
    /// Callers serialize submissions per queue.
    pub fn submit(&self, queue: QueueKind, info: &SubmitInfo<'_>) -> Result<(), GraphicsError> {
        match self {
            Self::Dummy(backend) => backend.submit(queue, info),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => backend.submit(queue, info),
        }
    }

    /// Block until all queues are idle.
    pub fn wait_idle(&self) -> Result<(), GraphicsError> {
        match self {
            Self::Dummy(backend) => backend.wait_idle(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(backend) => backend.wait_idle(),
        }
    }
}

// ============================================================================
// Resource handles
// ============================================================================

/// Handle to a GPU buffer resource.
#[allow(clippy::large_enum_variant)]
pub enum GpuBuffer {
    Dummy(Arc<dummy::DummyBuffer>),
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        buffer: vk::Buffer,
        size: u64,
    },
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(buffer) => f.debug_tuple("GpuBuffer::Dummy").field(buffer).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { buffer, size, .. } => f
                .debug_struct("GpuBuffer::Vulkan")
                .field("buffer", buffer)
                .field("size", size)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to one device memory block.
#[allow(clippy::large_enum_variant)]
pub enum GpuMemory {
    Dummy(Arc<dummy::DummyMemory>),
    #[cfg(feature = "vulkan-backend")]
    Vulkan(vulkan::VulkanMemory),
}

impl GpuMemory {
    /// Copy `data` into the block at `offset`.
    ///
    /// Fails unless the block was allocated host visible.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        match self {
            Self::Dummy(memory) => memory.write(offset, data),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(memory) => memory.write(offset, data),
        }
    }

    /// Copy bytes out of the block at `offset`.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), GraphicsError> {
        match self {
            Self::Dummy(memory) => memory.read(offset, out),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(memory) => memory.read(offset, out),
        }
    }
}

impl std::fmt::Debug for GpuMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(memory) => f.debug_tuple("GpuMemory::Dummy").field(memory).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan(memory) => f.debug_tuple("GpuMemory::Vulkan").field(memory).finish(),
        }
    }
}

/// Handle to a descriptor pool.
pub enum GpuDescriptorPool {
    Dummy(Arc<dummy::DummyDescriptorPool>),
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        pool: vk::DescriptorPool,
    },
}

impl std::fmt::Debug for GpuDescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(pool) => f.debug_tuple("GpuDescriptorPool::Dummy").field(pool).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { pool, .. } => f
                .debug_struct("GpuDescriptorPool::Vulkan")
                .field("pool", pool)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a descriptor set. Freed with its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuDescriptorSet {
    Dummy { id: u64 },
    #[cfg(feature = "vulkan-backend")]
    Vulkan { set: vk::DescriptorSet },
}

/// Handle to a GPU fence for CPU-GPU synchronization.
pub enum GpuFence {
    Dummy(Arc<dummy::DummyFence>),
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        fence: vk::Fence,
    },
}

impl GpuFence {
    /// Wait until signaled or `timeout` elapses.
    ///
    /// Returns `Ok(false)` on timeout. Device loss and other API failures are
    /// returned as errors.
    pub fn wait(&self, timeout: Duration) -> Result<bool, GraphicsError> {
        match self {
            Self::Dummy(fence) => fence.wait(timeout),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { device, fence } => {
                let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
                match unsafe { device.wait_for_fences(&[*fence], true, timeout_ns) } {
                    Ok(()) => Ok(true),
                    Err(vk::Result::TIMEOUT) => Ok(false),
                    Err(e) => Err(vulkan::conversion::convert_result(e, "vkWaitForFences")),
                }
            }
        }
    }

    /// Non-blocking signaled check.
    pub fn status(&self) -> Result<bool, GraphicsError> {
        match self {
            Self::Dummy(fence) => fence.wait(Duration::ZERO),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { device, fence } => unsafe { device.get_fence_status(*fence) }
                .map_err(|e| vulkan::conversion::convert_result(e, "vkGetFenceStatus")),
        }
    }

    /// Return the fence to the unsignaled state.
    pub fn reset(&self) -> Result<(), GraphicsError> {
        match self {
            Self::Dummy(fence) => {
                fence.reset();
                Ok(())
            }
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { device, fence } => unsafe { device.reset_fences(&[*fence]) }
                .map_err(|e| vulkan::conversion::convert_result(e, "vkResetFences")),
        }
    }
}

impl std::fmt::Debug for GpuFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(fence) => f.debug_tuple("GpuFence::Dummy").field(fence).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { fence, .. } => f
                .debug_struct("GpuFence::Vulkan")
                .field("fence", fence)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a GPU semaphore for GPU-GPU synchronization.
pub enum GpuSemaphore {
    Dummy(Arc<dummy::DummySemaphore>),
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        semaphore: vk::Semaphore,
    },
}

impl std::fmt::Debug for GpuSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(semaphore) => f.debug_tuple("GpuSemaphore::Dummy").field(semaphore).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan { semaphore, .. } => f
                .debug_struct("GpuSemaphore::Vulkan")
                .field("semaphore", semaphore)
                .finish_non_exhaustive(),
        }
    }
}

/// Handle to a command buffer.
///
/// Recording methods take `&self`; the owning [`CommandBuffer`](crate::CommandBuffer)
/// guarantees a single recorder at a time.
pub enum GpuCommandBuffer {
    Dummy(Arc<dummy::DummyCommandBuffer>),
    #[cfg(feature = "vulkan-backend")]
    Vulkan {
        device: ash::Device,
        pool: vk::CommandPool,
        command_buffer: vk::CommandBuffer,
        level: CommandBufferLevel,
    },
}

impl GpuCommandBuffer {
    /// Reset and begin recording.
    pub fn begin(&self) -> Result<(), GraphicsError> {
        match self {
            Self::Dummy(cmd) => cmd.begin(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan {
                device,
                command_buffer,
                level,
                ..
            } => vulkan::command::begin(device, *command_buffer, *level),
        }
    }

    /// Finish recording.
    pub fn end(&self) -> Result<(), GraphicsError> {
        match self {
            Self::Dummy(cmd) => cmd.end(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan {
                device,
                command_buffer,
                ..
            } => unsafe { device.end_command_buffer(*command_buffer) }
                .map_err(|e| vulkan::conversion::convert_result(e, "vkEndCommandBuffer")),
        }
    }

    /// Record a buffer-to-buffer copy.
    pub fn copy_buffer(&self, src: &GpuBuffer, dst: &GpuBuffer, regions: &[CopyRegion]) {
        match self {
            Self::Dummy(cmd) => cmd.copy_buffer(src, dst, regions),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan {
                device,
                command_buffer,
                ..
            } => vulkan::command::copy_buffer(device, *command_buffer, src, dst, regions),
        }
    }

    /// Record a fill of `size` bytes at `offset` with a repeated `value`.
    pub fn fill_buffer(&self, dst: &GpuBuffer, offset: u64, size: u64, value: u32) {
        match self {
            Self::Dummy(cmd) => cmd.fill_buffer(dst, offset, size, value),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan {
                device,
                command_buffer,
                ..
            } => vulkan::command::fill_buffer(device, *command_buffer, dst, offset, size, value),
        }
    }

    /// Record execution of secondary command buffers.
    pub fn execute_commands(&self, secondaries: &[&GpuCommandBuffer]) {
        match self {
            Self::Dummy(cmd) => cmd.execute_commands(secondaries),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan {
                device,
                command_buffer,
                ..
            } => vulkan::command::execute_commands(device, *command_buffer, secondaries),
        }
    }
}

impl std::fmt::Debug for GpuCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dummy(cmd) => f.debug_tuple("GpuCommandBuffer::Dummy").field(cmd).finish(),
            #[cfg(feature = "vulkan-backend")]
            Self::Vulkan {
                command_buffer,
                level,
                ..
            } => f
                .debug_struct("GpuCommandBuffer::Vulkan")
                .field("command_buffer", command_buffer)
                .field("level", level)
                .finish_non_exhaustive(),
        }
    }
}

// ============================================================================
// Vulkan Resource Cleanup (Drop implementations)
// ============================================================================

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let GpuBuffer::Vulkan { device, buffer, .. } = self {
            unsafe {
                device.destroy_buffer(*buffer, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuDescriptorPool {
    fn drop(&mut self) {
        if let GpuDescriptorPool::Vulkan { device, pool } = self {
            unsafe {
                device.destroy_descriptor_pool(*pool, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuFence {
    fn drop(&mut self) {
        if let GpuFence::Vulkan { device, fence } = self {
            unsafe {
                device.destroy_fence(*fence, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuSemaphore {
    fn drop(&mut self) {
        if let GpuSemaphore::Vulkan { device, semaphore } = self {
            unsafe {
                device.destroy_semaphore(*semaphore, None);
            }
        }
    }
}

#[cfg(feature = "vulkan-backend")]
impl Drop for GpuCommandBuffer {
    fn drop(&mut self) {
        if let GpuCommandBuffer::Vulkan { device, pool, .. } = self {
            // Destroying the pool frees its command buffer.
            unsafe {
                device.destroy_command_pool(*pool, None);
            }
        }
    }
}

static_assertions::assert_impl_all!(GpuBackend: Send, Sync);
static_assertions::assert_impl_all!(GpuBuffer: Send, Sync);
static_assertions::assert_impl_all!(GpuMemory: Send, Sync);
static_assertions::assert_impl_all!(GpuFence: Send, Sync);
static_assertions::assert_impl_all!(GpuCommandBuffer: Send, Sync);
