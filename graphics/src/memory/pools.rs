//! Growing pools of device memory blocks and buffers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arbor_core::profiling::{profile_plot, profile_scope};
use parking_lot::Mutex;

use crate::backend::GpuBackend;
use crate::error::GraphicsError;
use crate::resources::{Buffer, DeviceMemory};
use crate::types::{BufferDescriptor, BufferUsage, MemoryProperties, MemoryRequirements, SharingMode};

use super::{Arena, BufferLease, MemoryLease, ResourcePreferences};

struct MemoryPoolState {
    arenas: Vec<Arc<DeviceMemory>>,
    allocated: u64,
}

/// Pools of device memory blocks and of buffers bound into them.
///
/// Each pool is an ordered list of arenas behind its own mutex. A request
/// walks the compatible arenas in creation order and takes the first range
/// that fits. When none fits the pool creates exactly one new arena of
/// `max(request, minimum)` bytes, appends it, and serves the request from it.
/// Arenas are never removed or shrunk.
///
/// Failures of the underlying API while growing are returned unchanged;
/// running out of room in existing arenas never is.
pub struct MemoryBufferPools {
    name: String,
    backend: Arc<GpuBackend>,
    preferences: ResourcePreferences,
    memory_pools: Mutex<MemoryPoolState>,
    buffer_pools: Mutex<Vec<Arc<Buffer>>>,
    next_id: AtomicU64,
}

impl MemoryBufferPools {
    pub fn new(
        name: impl Into<String>,
        backend: Arc<GpuBackend>,
        preferences: ResourcePreferences,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            preferences,
            memory_pools: Mutex::new(MemoryPoolState {
                arenas: Vec::new(),
                allocated: 0,
            }),
            buffer_pools: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn preferences(&self) -> &ResourcePreferences {
        &self.preferences
    }

    /// Reserve a range of device memory matching `requirements`.
    pub fn reserve_memory(
        &self,
        requirements: &MemoryRequirements,
        properties: MemoryProperties,
    ) -> Result<MemoryLease, GraphicsError> {
        profile_scope!("MemoryBufferPools::reserve_memory");

        if requirements.size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "cannot reserve zero bytes of device memory".to_string(),
            ));
        }

        let mut state = self.memory_pools.lock();

        for memory in &state.arenas {
            if memory.properties() != properties
                || memory.memory_type_bits() != requirements.memory_type_bits
            {
                continue;
            }
            if let Some(offset) = memory
                .slots()
                .lock()
                .reserve(requirements.size, requirements.alignment)
            {
                return Ok(MemoryLease::new(memory, offset, requirements.size));
            }
        }

        let block_size = requirements
            .size
            .max(self.preferences.minimum_device_memory_size);

        if let Some(limit) = self.preferences.allocated_memory_limit
            && state.allocated + block_size > limit
        {
            return Err(GraphicsError::OutOfDeviceMemory(format!(
                "pool '{}' needs a {block_size} byte block but has {} of {limit} bytes allocated",
                self.name, state.allocated
            )));
        }

        let gpu = self.backend.allocate_memory(
            &MemoryRequirements {
                size: block_size,
                alignment: requirements.alignment,
                memory_type_bits: requirements.memory_type_bits,
            },
            properties,
        )?;

        let memory = Arc::new(DeviceMemory::new(
            self.next_id(),
            block_size,
            properties,
            requirements.memory_type_bits,
            gpu,
        ));
        let offset = memory
            .slots()
            .lock()
            .reserve(requirements.size, requirements.alignment)
            .ok_or_else(|| {
                GraphicsError::Internal(format!(
                    "new {block_size} byte memory block cannot hold {} bytes",
                    requirements.size
                ))
            })?;

        state.allocated += block_size;
        state.arenas.push(Arc::clone(&memory));

        log::debug!(
            "MemoryBufferPools '{}': new device memory block {} ({block_size} bytes, {:?}), {} blocks / {} bytes total",
            self.name,
            memory.id(),
            properties,
            state.arenas.len(),
            state.allocated
        );
        profile_plot!("device_memory_allocated", state.allocated);

        Ok(MemoryLease::new(&memory, offset, requirements.size))
    }

    /// Reserve `total_size` bytes at a multiple of `alignment` in a buffer of
    /// the given usage, sharing mode and memory properties.
    pub fn reserve_buffer(
        &self,
        total_size: u64,
        alignment: u64,
        usage: BufferUsage,
        sharing_mode: SharingMode,
        properties: MemoryProperties,
    ) -> Result<BufferLease, GraphicsError> {
        profile_scope!("MemoryBufferPools::reserve_buffer");

        if total_size == 0 {
            return Err(GraphicsError::InvalidParameter(
                "cannot reserve an empty buffer range".to_string(),
            ));
        }

        let mut buffers = self.buffer_pools.lock();

        for buffer in buffers.iter() {
            if !buffer.matches(usage, sharing_mode, properties) {
                continue;
            }
            if let Some(offset) = buffer.slots().lock().reserve(total_size, alignment) {
                return Ok(BufferLease::new(buffer, offset, total_size));
            }
        }

        let buffer_size = total_size.max(self.preferences.minimum_buffer_size);
        let id = self.next_id();
        let descriptor = BufferDescriptor::new(buffer_size, usage)
            .with_sharing_mode(sharing_mode)
            .with_label(format!("{} buffer {id}", self.name));

        let gpu = self.backend.create_buffer(&descriptor)?;
        let requirements = self.backend.buffer_memory_requirements(&gpu);
        let memory_lease = self.reserve_memory(&requirements, properties)?;
        let memory = memory_lease.memory().ok_or_else(|| {
            GraphicsError::Internal("memory block dropped while reserving".to_string())
        })?;
        self.backend
            .bind_buffer_memory(&gpu, memory.gpu(), memory_lease.offset())?;

        let buffer = Arc::new(Buffer::new(id, descriptor, properties, gpu, memory_lease));
        let offset = buffer
            .slots()
            .lock()
            .reserve(total_size, alignment)
            .ok_or_else(|| {
                GraphicsError::Internal(format!(
                    "new {buffer_size} byte buffer cannot hold {total_size} bytes"
                ))
            })?;

        buffers.push(Arc::clone(&buffer));

        log::debug!(
            "MemoryBufferPools '{}': new buffer {} ({buffer_size} bytes, {:?}, {:?}), {} buffers total",
            self.name,
            buffer.id(),
            usage,
            properties,
            buffers.len()
        );

        Ok(BufferLease::new(&buffer, offset, total_size))
    }

    /// Number of device memory blocks.
    pub fn memory_arena_count(&self) -> usize {
        self.memory_pools.lock().arenas.len()
    }

    /// Number of buffers.
    pub fn buffer_arena_count(&self) -> usize {
        self.buffer_pools.lock().len()
    }

    /// Snapshot of the buffer arenas in creation order.
    pub fn buffers(&self) -> Vec<Arc<Buffer>> {
        self.buffer_pools.lock().clone()
    }

    /// Snapshot of the memory arenas in creation order.
    pub fn memory_blocks(&self) -> Vec<Arc<DeviceMemory>> {
        self.memory_pools.lock().arenas.clone()
    }

    /// Bytes of device memory allocated from the backend.
    pub fn allocated_memory(&self) -> u64 {
        self.memory_pools.lock().allocated
    }

    /// Free bytes across all memory blocks with these properties.
    pub fn compute_memory_total_available(&self, properties: MemoryProperties) -> u64 {
        self.memory_pools
            .lock()
            .arenas
            .iter()
            .filter(|memory| memory.properties() == properties)
            .map(|memory| memory.total_available_size())
            .sum()
    }

    /// Reserved bytes across all memory blocks with these properties.
    pub fn compute_memory_total_reserved(&self, properties: MemoryProperties) -> u64 {
        self.memory_pools
            .lock()
            .arenas
            .iter()
            .filter(|memory| memory.properties() == properties)
            .map(|memory| memory.total_reserved_size())
            .sum()
    }

    /// Free bytes across all buffers.
    pub fn compute_buffer_total_available(&self) -> u64 {
        self.buffer_pools
            .lock()
            .iter()
            .map(|buffer| buffer.total_available_size())
            .sum()
    }

    /// Reserved bytes across all buffers.
    pub fn compute_buffer_total_reserved(&self) -> u64 {
        self.buffer_pools
            .lock()
            .iter()
            .map(|buffer| buffer.total_reserved_size())
            .sum()
    }

    /// Log every arena at debug level.
    pub fn report(&self) {
        let state = self.memory_pools.lock();
        log::debug!(
            "MemoryBufferPools '{}': {} memory blocks, {} bytes allocated",
            self.name,
            state.arenas.len(),
            state.allocated
        );
        for memory in &state.arenas {
            log::debug!("  {memory:?}");
            memory.slots().lock().report();
        }
        drop(state);

        for buffer in self.buffer_pools.lock().iter() {
            log::debug!("  {buffer:?}");
            buffer.slots().lock().report();
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MemoryBufferPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBufferPools")
            .field("name", &self.name)
            .field("memory_arenas", &self.memory_arena_count())
            .field("buffer_arenas", &self.buffer_arena_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(MemoryBufferPools: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DummyBackend, DummyConfig};

    const HOST: MemoryProperties = MemoryProperties::HOST_VISIBLE.union(MemoryProperties::HOST_COHERENT);

    fn pools(preferences: ResourcePreferences) -> MemoryBufferPools {
        MemoryBufferPools::new(
            "test",
            Arc::new(GpuBackend::Dummy(DummyBackend::new())),
            preferences,
        )
    }

    fn small_preferences() -> ResourcePreferences {
        ResourcePreferences::new()
            .with_minimum_buffer_size(1024)
            .with_minimum_device_memory_size(4096)
    }

    fn uniform(pools: &MemoryBufferPools, size: u64) -> BufferLease {
        pools
            .reserve_buffer(
                size,
                16,
                BufferUsage::UNIFORM,
                SharingMode::Exclusive,
                MemoryProperties::DEVICE_LOCAL,
            )
            .unwrap()
    }

    #[test]
    fn test_first_reservation_creates_minimum_sized_arena() {
        let pools = pools(small_preferences());
        let lease = uniform(&pools, 100);

        assert_eq!(pools.buffer_arena_count(), 1);
        assert_eq!(pools.memory_arena_count(), 1);
        assert_eq!(lease.offset(), 0);
        assert_eq!(lease.buffer().unwrap().size(), 1024);
        assert_eq!(pools.allocated_memory(), 4096);
    }

    #[test]
    fn test_reservations_share_arena_until_full() {
        let pools = pools(small_preferences());
        let a = uniform(&pools, 512);
        let b = uniform(&pools, 512);
        assert_eq!(pools.buffer_arena_count(), 1);
        assert!(Arc::ptr_eq(&a.buffer().unwrap(), &b.buffer().unwrap()));

        let c = uniform(&pools, 16);
        assert_eq!(pools.buffer_arena_count(), 2);
        assert!(!Arc::ptr_eq(&a.buffer().unwrap(), &c.buffer().unwrap()));
        // Both buffers fit in the first memory block.
        assert_eq!(pools.memory_arena_count(), 1);
    }

    #[test]
    fn test_oversized_request_sizes_arena_to_request() {
        let pools = pools(small_preferences());
        let lease = uniform(&pools, 10_000);
        assert_eq!(lease.buffer().unwrap().size(), 10_000);
        assert_eq!(pools.memory_blocks()[0].size(), 10_000);
    }

    #[test]
    fn test_usage_and_properties_partition_arenas() {
        let pools = pools(small_preferences());
        let _uniform = uniform(&pools, 64);
        let _vertex = pools
            .reserve_buffer(
                64,
                4,
                BufferUsage::VERTEX,
                SharingMode::Exclusive,
                MemoryProperties::DEVICE_LOCAL,
            )
            .unwrap();
        let _staging = pools
            .reserve_buffer(64, 4, BufferUsage::COPY_SRC, SharingMode::Exclusive, HOST)
            .unwrap();

        assert_eq!(pools.buffer_arena_count(), 3);
        assert_eq!(pools.memory_arena_count(), 2);
    }

    #[test]
    fn test_released_range_is_reused_without_growth() {
        let pools = pools(small_preferences());
        let mut lease = uniform(&pools, 1024);
        lease.release();
        let again = uniform(&pools, 1024);
        assert_eq!(again.offset(), 0);
        assert_eq!(pools.buffer_arena_count(), 1);
    }

    #[test]
    fn test_totals() {
        let pools = pools(small_preferences());
        let _a = uniform(&pools, 100);
        let _b = uniform(&pools, 200);
        assert_eq!(pools.compute_buffer_total_reserved(), 300);
        assert_eq!(pools.compute_buffer_total_available(), 724);
        assert_eq!(
            pools.compute_memory_total_reserved(MemoryProperties::DEVICE_LOCAL),
            1024
        );
        assert_eq!(
            pools.compute_memory_total_available(MemoryProperties::DEVICE_LOCAL),
            3072
        );
        assert_eq!(pools.compute_memory_total_available(HOST), 0);
    }

    #[test]
    fn test_memory_limit_surfaces_error() {
        let pools = pools(small_preferences().with_allocated_memory_limit(4096));
        let _a = uniform(&pools, 4000);
        let result = pools.reserve_buffer(
            4000,
            16,
            BufferUsage::UNIFORM,
            SharingMode::Exclusive,
            MemoryProperties::DEVICE_LOCAL,
        );
        assert!(matches!(result, Err(GraphicsError::OutOfDeviceMemory(_))));
        assert_eq!(pools.memory_arena_count(), 1);
    }

    #[test]
    fn test_backend_failure_propagates() {
        let backend = DummyBackend::with_config(DummyConfig::new().with_memory_allocation_limit(0));
        let pools = MemoryBufferPools::new(
            "failing",
            Arc::new(GpuBackend::Dummy(backend)),
            small_preferences(),
        );
        let result = pools.reserve_buffer(
            64,
            16,
            BufferUsage::UNIFORM,
            SharingMode::Exclusive,
            MemoryProperties::DEVICE_LOCAL,
        );
        assert!(matches!(result, Err(GraphicsError::OutOfDeviceMemory(_))));
        assert_eq!(pools.buffer_arena_count(), 0);
        assert_eq!(pools.memory_arena_count(), 0);
    }

    #[test]
    fn test_zero_size_rejected() {
        let pools = pools(small_preferences());
        let result = pools.reserve_buffer(
            0,
            16,
            BufferUsage::UNIFORM,
            SharingMode::Exclusive,
            MemoryProperties::DEVICE_LOCAL,
        );
        assert!(matches!(result, Err(GraphicsError::InvalidParameter(_))));
    }

    #[test]
    fn test_host_visible_lease_write_read() {
        let pools = pools(small_preferences());
        let _pad = pools
            .reserve_buffer(8, 16, BufferUsage::COPY_SRC, SharingMode::Exclusive, HOST)
            .unwrap();
        let lease = pools
            .reserve_buffer(8, 16, BufferUsage::COPY_SRC, SharingMode::Exclusive, HOST)
            .unwrap();
        lease.write(0, &[5, 6, 7, 8]).unwrap();

        let mut out = [0u8; 4];
        lease.read(0, &mut out).unwrap();
        assert_eq!(out, [5, 6, 7, 8]);
        assert!(lease.write(6, &[0; 4]).is_err());
    }
}
