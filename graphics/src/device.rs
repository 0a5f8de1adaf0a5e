//! Graphics device.
//!
//! The [`GraphicsDevice`] owns the backend, the queues and every resource
//! pool. Nothing is global: pipelines, transfer tasks and leases all hang off
//! a device.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{BackendKind, DummyBackend, DummyConfig, GpuBackend};
use crate::command::CommandBuffer;
use crate::error::GraphicsError;
use crate::memory::{
    BufferLease, DescriptorPools, DescriptorSetLease, MemoryBufferPools, MemoryLease,
    ResourcePreferences, ResourceRequirements,
};
use crate::queue::Queue;
use crate::sync::{Fence, Semaphore};
use crate::types::{
    BufferUsage, CommandBufferLevel, DescriptorSetLayout, MemoryProperties, MemoryRequirements,
    PipelineStage, QueueKind, SharingMode,
};

/// Parameters for [`GraphicsDevice::new`].
#[derive(Debug, Clone, Default)]
pub struct DeviceParameters {
    /// Backend to create.
    pub backend: BackendKind,
    /// Enable API validation where the backend supports it.
    pub validation: bool,
    /// Behaviour of the stub GPU when `backend` is [`BackendKind::Dummy`].
    pub dummy: DummyConfig,
    /// Pool growth policy.
    pub preferences: ResourcePreferences,
}

impl DeviceParameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_dummy_config(mut self, config: DummyConfig) -> Self {
        self.dummy = config;
        self
    }

    pub fn with_preferences(mut self, preferences: ResourcePreferences) -> Self {
        self.preferences = preferences;
        self
    }
}

/// A graphics device for creating GPU resources.
///
/// # Thread Safety
///
/// `GraphicsDevice` is `Send + Sync`. Pool reservations, command buffer and
/// sync object creation may run from any thread.
///
/// # Example
///
/// ```
/// use arbor_graphics::{BufferUsage, DeviceParameters, GraphicsDevice, MemoryProperties, SharingMode};
///
/// let device = GraphicsDevice::new(DeviceParameters::new()).unwrap();
/// let lease = device
///     .reserve_buffer(256, 16, BufferUsage::UNIFORM, SharingMode::Exclusive, MemoryProperties::DEVICE_LOCAL)
///     .unwrap();
/// assert_eq!(lease.range(), 256);
/// ```
pub struct GraphicsDevice {
    // Pools and queues hold the backend too; listed first so they drop first.
    memory_pools: MemoryBufferPools,
    descriptor_pools: DescriptorPools,
    graphics_queue: Queue,
    transfer_queue: Queue,
    backend: Arc<GpuBackend>,
    next_id: AtomicU64,
}

impl GraphicsDevice {
    /// Create a device and its backend.
    pub fn new(parameters: DeviceParameters) -> Result<Arc<Self>, GraphicsError> {
        let backend = match parameters.backend {
            BackendKind::Dummy => {
                GpuBackend::Dummy(DummyBackend::with_config(parameters.dummy.clone()))
            }
            kind => GpuBackend::new(kind, parameters.validation)?,
        };
        let backend = Arc::new(backend);

        log::info!("Created graphics device on the {} backend", backend.name());

        Ok(Arc::new(Self {
            memory_pools: MemoryBufferPools::new(
                "device",
                Arc::clone(&backend),
                parameters.preferences.clone(),
            ),
            descriptor_pools: DescriptorPools::new(
                Arc::clone(&backend),
                parameters.preferences,
            ),
            graphics_queue: Queue::new(QueueKind::Graphics, Arc::clone(&backend)),
            transfer_queue: Queue::new(QueueKind::Transfer, Arc::clone(&backend)),
            backend,
            next_id: AtomicU64::new(1),
        }))
    }

    /// Get the backend name.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn backend(&self) -> &Arc<GpuBackend> {
        &self.backend
    }

    /// The stub backend, for tests that inject failures or inspect submissions.
    pub fn dummy(&self) -> Option<&DummyBackend> {
        self.backend.as_dummy()
    }

    pub fn memory_pools(&self) -> &MemoryBufferPools {
        &self.memory_pools
    }

    pub fn descriptor_pools(&self) -> &DescriptorPools {
        &self.descriptor_pools
    }

    pub fn queue(&self, kind: QueueKind) -> &Queue {
        match kind {
            QueueKind::Graphics => &self.graphics_queue,
            QueueKind::Transfer => &self.transfer_queue,
        }
    }

    /// Reserve a buffer range from the device pools.
    pub fn reserve_buffer(
        &self,
        total_size: u64,
        alignment: u64,
        usage: BufferUsage,
        sharing_mode: SharingMode,
        properties: MemoryProperties,
    ) -> Result<BufferLease, GraphicsError> {
        self.memory_pools
            .reserve_buffer(total_size, alignment, usage, sharing_mode, properties)
    }

    /// Reserve a device memory range from the device pools.
    pub fn reserve_memory(
        &self,
        requirements: &MemoryRequirements,
        properties: MemoryProperties,
    ) -> Result<MemoryLease, GraphicsError> {
        self.memory_pools.reserve_memory(requirements, properties)
    }

    /// Grow descriptor pools ahead of a batch of allocations.
    pub fn reserve_descriptors(
        &self,
        requirements: &ResourceRequirements,
    ) -> Result<(), GraphicsError> {
        self.descriptor_pools.reserve(requirements)
    }

    pub fn allocate_descriptor_set(
        &self,
        layout: &DescriptorSetLayout,
    ) -> Result<DescriptorSetLease, GraphicsError> {
        self.descriptor_pools.allocate_descriptor_set(layout)
    }

    /// Create an unsignaled fence.
    pub fn create_fence(&self) -> Result<Fence, GraphicsError> {
        let gpu = self.backend.create_fence(false)?;
        Ok(Fence::new(self.next_id(), gpu))
    }

    /// Create a semaphore that waiters block on at `wait_stage`.
    pub fn create_semaphore(&self, wait_stage: PipelineStage) -> Result<Semaphore, GraphicsError> {
        let gpu = self.backend.create_semaphore()?;
        Ok(Semaphore::new(self.next_id(), gpu, wait_stage))
    }

    pub fn create_command_buffer(
        &self,
        queue: QueueKind,
        level: CommandBufferLevel,
    ) -> Result<CommandBuffer, GraphicsError> {
        let gpu = self.backend.create_command_buffer(queue, level)?;
        Ok(CommandBuffer::new(self.next_id(), queue, level, gpu))
    }

    /// Block until the device has no work in flight.
    pub fn wait_idle(&self) -> Result<(), GraphicsError> {
        self.backend.wait_idle()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for GraphicsDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphicsDevice")
            .field("backend", &self.backend.name())
            .field("memory_pools", &self.memory_pools)
            .field("descriptor_pools", &self.descriptor_pools)
            .finish()
    }
}

// Ensure GraphicsDevice is Send + Sync
static_assertions::assert_impl_all!(GraphicsDevice: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_creation() {
        let device = GraphicsDevice::new(DeviceParameters::new()).unwrap();
        assert_eq!(device.backend_name(), "Dummy Backend");
        assert!(device.dummy().is_some());
    }

    #[cfg(not(feature = "vulkan-backend"))]
    #[test]
    fn test_vulkan_unavailable_without_feature() {
        let result = GraphicsDevice::new(DeviceParameters::new().with_backend(BackendKind::Vulkan));
        assert!(matches!(result, Err(GraphicsError::InitializationFailed(_))));
    }

    #[test]
    fn test_sync_objects_have_unique_ids() {
        let device = GraphicsDevice::new(DeviceParameters::new()).unwrap();
        let fence = device.create_fence().unwrap();
        let semaphore = device.create_semaphore(PipelineStage::TRANSFER).unwrap();
        let cmd = device
            .create_command_buffer(QueueKind::Graphics, CommandBufferLevel::Primary)
            .unwrap();
        assert_ne!(fence.id(), semaphore.id());
        assert_ne!(semaphore.id(), cmd.id());
        assert_eq!(semaphore.wait_stage(), PipelineStage::TRANSFER);
    }

    #[test]
    fn test_queue_kinds() {
        let device = GraphicsDevice::new(DeviceParameters::new()).unwrap();
        assert_eq!(device.queue(QueueKind::Graphics).kind(), QueueKind::Graphics);
        assert_eq!(device.queue(QueueKind::Transfer).kind(), QueueKind::Transfer);
    }
}
