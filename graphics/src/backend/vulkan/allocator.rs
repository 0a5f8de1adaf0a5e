//! Device memory blocks carved out of gpu-allocator.
//!
//! The pools above hand out sub-ranges of large blocks themselves, so each
//! block is one dedicated gpu-allocator allocation and never gets
//! sub-allocated here.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use parking_lot::Mutex;

use crate::error::GraphicsError;
use crate::types::{MemoryProperties, MemoryRequirements};

use super::conversion::convert_memory_location;

/// Create a memory allocator for the Vulkan device.
pub fn create_allocator(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
) -> Result<Allocator, GraphicsError> {
    Allocator::new(&AllocatorCreateDesc {
        instance: instance.clone(),
        device,
        physical_device,
        debug_settings: Default::default(),
        buffer_device_address: false,
        allocation_sizes: gpu_allocator::AllocationSizes::default(),
    })
    .map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create memory allocator: {}", e))
    })
}

/// One device memory block.
pub struct VulkanMemory {
    allocator: Arc<Mutex<Allocator>>,
    allocation: Mutex<Option<Allocation>>,
    memory: vk::DeviceMemory,
    base_offset: u64,
    size: u64,
}

impl VulkanMemory {
    pub(super) fn allocate(
        allocator: &Arc<Mutex<Allocator>>,
        requirements: &MemoryRequirements,
        properties: MemoryProperties,
    ) -> Result<Self, GraphicsError> {
        let allocation = allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name: "arbor memory block",
                requirements: vk::MemoryRequirements {
                    size: requirements.size,
                    alignment: requirements.alignment.max(1),
                    memory_type_bits: requirements.memory_type_bits,
                },
                location: convert_memory_location(properties),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(|e| match e {
                gpu_allocator::AllocationError::OutOfMemory => GraphicsError::OutOfDeviceMemory(
                    format!("{} byte block: {}", requirements.size, e),
                ),
                other => GraphicsError::ResourceCreationFailed(format!(
                    "Failed to allocate {} byte block: {}",
                    requirements.size, other
                )),
            })?;

        // SAFETY: the allocation stays alive until this block drops.
        let memory = unsafe { allocation.memory() };
        let base_offset = allocation.offset();

        Ok(Self {
            allocator: Arc::clone(allocator),
            allocation: Mutex::new(Some(allocation)),
            memory,
            base_offset,
            size: requirements.size,
        })
    }

    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    /// Offset of this block inside its `vk::DeviceMemory`.
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    fn mapped_range(&self, offset: u64, len: usize) -> Result<*mut u8, GraphicsError> {
        let end = offset.checked_add(len as u64);
        if end.is_none_or(|end| end > self.size) {
            return Err(GraphicsError::InvalidParameter(format!(
                "range {}+{} outside {} byte block",
                offset, len, self.size
            )));
        }

        let allocation = self.allocation.lock();
        let ptr = allocation
            .as_ref()
            .and_then(|a| a.mapped_ptr())
            .ok_or_else(|| {
                GraphicsError::InvalidParameter("memory block is not host visible".to_string())
            })?;

        // SAFETY: the range was checked against the block size above.
        Ok(unsafe { ptr.as_ptr().cast::<u8>().add(offset as usize) })
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        let dst = self.mapped_range(offset, data.len())?;
        // SAFETY: dst points at `data.len()` mapped bytes owned by this block.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), GraphicsError> {
        let src = self.mapped_range(offset, out.len())?;
        // SAFETY: src points at `out.len()` mapped bytes owned by this block.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
        Ok(())
    }
}

impl Drop for VulkanMemory {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.get_mut().take()
            && let Err(e) = self.allocator.lock().free(allocation)
        {
            log::error!("Failed to free device memory block: {}", e);
        }
    }
}

impl std::fmt::Debug for VulkanMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanMemory")
            .field("memory", &self.memory)
            .field("base_offset", &self.base_offset)
            .field("size", &self.size)
            .finish()
    }
}
