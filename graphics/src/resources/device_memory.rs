//! Device memory block arena.

use parking_lot::Mutex;

use crate::backend::GpuMemory;
use crate::error::GraphicsError;
use crate::memory::{Arena, MemorySlots};
use crate::types::MemoryProperties;

/// One block of device memory, sub-allocated by [`MemorySlots`].
pub struct DeviceMemory {
    id: u64,
    size: u64,
    properties: MemoryProperties,
    memory_type_bits: u32,
    gpu: GpuMemory,
    slots: Mutex<MemorySlots>,
}

impl DeviceMemory {
    pub(crate) fn new(
        id: u64,
        size: u64,
        properties: MemoryProperties,
        memory_type_bits: u32,
        gpu: GpuMemory,
    ) -> Self {
        Self {
            id,
            size,
            properties,
            memory_type_bits,
            gpu,
            slots: Mutex::new(MemorySlots::new(size)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn properties(&self) -> MemoryProperties {
        self.properties
    }

    /// Memory type bits of the requirements this block was allocated for.
    pub fn memory_type_bits(&self) -> u32 {
        self.memory_type_bits
    }

    /// Backend handle.
    pub fn gpu(&self) -> &GpuMemory {
        &self.gpu
    }

    /// Write through the host mapping at `offset` bytes into the block.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        self.gpu.write(offset, data)
    }

    /// Read through the host mapping at `offset` bytes into the block.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), GraphicsError> {
        self.gpu.read(offset, out)
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
}

impl Arena for DeviceMemory {
    fn slots(&self) -> &Mutex<MemorySlots> {
        &self.slots
    }
}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("properties", &self.properties)
            .field("reserved", &self.slots.lock().total_reserved_size())
            .finish()
    }
}

static_assertions::assert_impl_all!(DeviceMemory: Send, Sync);
