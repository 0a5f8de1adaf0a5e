//! GPU buffer arena.

use parking_lot::Mutex;

use crate::backend::GpuBuffer;
use crate::error::GraphicsError;
use crate::memory::{Arena, MemoryLease, MemorySlots};
use crate::types::{BufferDescriptor, BufferUsage, MemoryProperties, SharingMode};

/// A GPU buffer bound to a range of a [`DeviceMemory`](super::DeviceMemory)
/// block and sub-allocated by [`MemorySlots`].
///
/// Buffers are created by [`MemoryBufferPools`](crate::memory::MemoryBufferPools)
/// when no existing buffer of matching usage has room.
///
/// # Example
///
/// ```ignore
/// let lease = device.reserve_buffer(
///     256, 16, BufferUsage::UNIFORM, SharingMode::Exclusive,
///     MemoryProperties::HOST_VISIBLE | MemoryProperties::HOST_COHERENT,
/// )?;
/// let buffer = lease.buffer().unwrap();
/// println!("lease lives at {} in a {} byte buffer", lease.offset(), buffer.size());
/// ```
pub struct Buffer {
    id: u64,
    descriptor: BufferDescriptor,
    properties: MemoryProperties,
    // Declared before `memory` so the buffer object is destroyed before its
    // memory range is returned.
    gpu: GpuBuffer,
    memory: MemoryLease,
    slots: Mutex<MemorySlots>,
}

impl Buffer {
    pub(crate) fn new(
        id: u64,
        descriptor: BufferDescriptor,
        properties: MemoryProperties,
        gpu: GpuBuffer,
        memory: MemoryLease,
    ) -> Self {
        let slots = Mutex::new(MemorySlots::new(descriptor.size));
        Self {
            id,
            descriptor,
            properties,
            gpu,
            memory,
            slots,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Get the buffer descriptor.
    pub fn descriptor(&self) -> &BufferDescriptor {
        &self.descriptor
    }

    /// Get the buffer size in bytes.
    pub fn size(&self) -> u64 {
        self.descriptor.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.descriptor.usage
    }

    pub fn sharing_mode(&self) -> SharingMode {
        self.descriptor.sharing_mode
    }

    /// Properties of the memory the buffer is bound to.
    pub fn memory_properties(&self) -> MemoryProperties {
        self.properties
    }

    /// Get the buffer label, if set.
    pub fn label(&self) -> Option<&str> {
        self.descriptor.label.as_deref()
    }

    /// Backend handle.
    pub fn gpu(&self) -> &GpuBuffer {
        &self.gpu
    }

    /// The device memory range backing this buffer.
    pub fn memory(&self) -> &MemoryLease {
        &self.memory
    }

    /// Write `data` at `offset` bytes into the buffer through the host mapping.
    ///
    /// The buffer must live in host-visible memory.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        self.check_range(offset, data.len() as u64)?;
        let memory = self.memory.memory().ok_or_else(|| {
            GraphicsError::Internal(format!("buffer {} lost its memory block", self.id))
        })?;
        memory.write(self.memory.offset() + offset, data)
    }

    /// Read bytes at `offset` through the host mapping.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), GraphicsError> {
        self.check_range(offset, out.len() as u64)?;
        let memory = self.memory.memory().ok_or_else(|| {
            GraphicsError::Internal(format!("buffer {} lost its memory block", self.id))
        })?;
        memory.read(self.memory.offset() + offset, out)
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(), GraphicsError> {
        if offset.checked_add(len).is_none_or(|end| end > self.size()) {
            return Err(GraphicsError::InvalidParameter(format!(
                "access of {len} bytes at {offset} overruns buffer {} ({} bytes)",
                self.id,
                self.size()
            )));
        }
        Ok(())
    }

    pub fn total_available_size(&self) -> u64 {
        self.slots.lock().total_available_size()
    }

    pub fn total_reserved_size(&self) -> u64 {
        self.slots.lock().total_reserved_size()
    }

    pub fn maximum_available_space(&self) -> u64 {
        self.slots.lock().maximum_available_space()
    }

    /// Whether a pool request with these parameters may be placed here.
    pub(crate) fn matches(
        &self,
        usage: BufferUsage,
        sharing_mode: SharingMode,
        properties: MemoryProperties,
    ) -> bool {
        self.descriptor.usage == usage
            && self.descriptor.sharing_mode == sharing_mode
            && self.properties == properties
    }
}

impl Arena for Buffer {
    fn slots(&self) -> &Mutex<MemorySlots> {
        &self.slots
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("size", &self.descriptor.size)
            .field("usage", &self.descriptor.usage)
            .field("label", &self.descriptor.label)
            .finish()
    }
}

// Ensure Buffer is Send + Sync
static_assertions::assert_impl_all!(Buffer: Send, Sync);
