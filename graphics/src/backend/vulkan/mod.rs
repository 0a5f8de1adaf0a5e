//! Native Vulkan backend implementation using ash.
//!
//! The backend is headless: one graphics queue serves both queue kinds, and
//! device memory blocks come from gpu-allocator as dedicated allocations
//! that the pools sub-allocate themselves.

mod allocator;
pub(crate) mod command;
pub(crate) mod conversion;
mod debug;
mod device;
mod instance;

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use arbor_core::profiling::profile_scope;
use ash::vk;
use gpu_allocator::vulkan::Allocator;
use parking_lot::Mutex;

use crate::error::GraphicsError;
use crate::types::{
    BufferDescriptor, CommandBufferLevel, DescriptorPoolSize, DescriptorSetLayout,
    MemoryProperties, MemoryRequirements, QueueKind,
};

use super::{
    GpuBuffer, GpuCommandBuffer, GpuDescriptorPool, GpuDescriptorSet, GpuFence, GpuMemory,
    GpuSemaphore, SubmitInfo,
};

pub use allocator::VulkanMemory;

use self::conversion::{
    convert_buffer_usage, convert_descriptor_type, convert_pipeline_stage, convert_result,
    convert_sharing_mode,
};

/// Vulkan-based GPU backend using ash.
pub struct VulkanBackend {
    /// Keeps the Vulkan loader alive.
    _entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    graphics_queue: vk::Queue,
    graphics_queue_family: u32,
    /// Shared with every memory block so blocks can free themselves.
    /// Dropped by hand before the device is destroyed.
    allocator: ManuallyDrop<Arc<Mutex<Allocator>>>,
    /// `vkQueueSubmit` requires external synchronization on the queue.
    submit_lock: Mutex<()>,
    /// Set layouts are created on first use and live as long as the backend.
    set_layouts: Mutex<HashMap<DescriptorSetLayout, vk::DescriptorSetLayout>>,
}

impl VulkanBackend {
    /// Create the backend: instance, physical device, logical device and
    /// memory allocator.
    pub fn new(validation: bool) -> Result<Self, GraphicsError> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            GraphicsError::InitializationFailed(format!("Failed to load Vulkan: {}", e))
        })?;

        let (instance, debug_messenger, debug_utils) =
            instance::create_instance(&entry, validation)?;

        let physical_device = device::select_physical_device(&instance)?;
        let graphics_queue_family = device::find_graphics_queue_family(&instance, physical_device)?;
        let device =
            device::create_logical_device(&instance, physical_device, graphics_queue_family)?;
        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };

        let allocator = Arc::new(Mutex::new(allocator::create_allocator(
            &instance,
            physical_device,
            device.clone(),
        )?));

        log::info!("Vulkan backend initialized (validation: {})", validation);

        Ok(Self {
            _entry: entry,
            instance,
            debug_messenger,
            debug_utils,
            physical_device,
            device,
            graphics_queue,
            graphics_queue_family,
            allocator: ManuallyDrop::new(allocator),
            submit_lock: Mutex::new(()),
            set_layouts: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &'static str {
        "Vulkan Backend (ash)"
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Create an unbound buffer.
    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> Result<GpuBuffer, GraphicsError> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(descriptor.size)
            .usage(convert_buffer_usage(descriptor.usage))
            .sharing_mode(convert_sharing_mode(descriptor.sharing_mode));

        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }
            .map_err(|e| convert_result(e, "vkCreateBuffer"))?;

        Ok(GpuBuffer::Vulkan {
            device: self.device.clone(),
            buffer,
            size: descriptor.size,
        })
    }

    pub fn buffer_memory_requirements(&self, buffer: &GpuBuffer) -> MemoryRequirements {
        #[allow(unreachable_patterns)]
        match buffer {
            GpuBuffer::Vulkan { buffer, .. } => {
                let requirements = unsafe { self.device.get_buffer_memory_requirements(*buffer) };
                MemoryRequirements {
                    size: requirements.size,
                    alignment: requirements.alignment,
                    memory_type_bits: requirements.memory_type_bits,
                }
            }
            other => {
                log::error!("buffer_memory_requirements: foreign buffer {:?}", other);
                MemoryRequirements {
                    size: 0,
                    alignment: 1,
                    memory_type_bits: 0,
                }
            }
        }
    }

    /// Allocate one memory block.
    pub fn allocate_memory(
        &self,
        requirements: &MemoryRequirements,
        properties: MemoryProperties,
    ) -> Result<GpuMemory, GraphicsError> {
        profile_scope!("vulkan_allocate_memory");
        let memory = VulkanMemory::allocate(&self.allocator, requirements, properties)?;
        Ok(GpuMemory::Vulkan(memory))
    }

    pub fn bind_buffer_memory(
        &self,
        buffer: &GpuBuffer,
        memory: &GpuMemory,
        offset: u64,
    ) -> Result<(), GraphicsError> {
        #[allow(unreachable_patterns)]
        match (buffer, memory) {
            (GpuBuffer::Vulkan { buffer, .. }, GpuMemory::Vulkan(memory)) => unsafe {
                self.device.bind_buffer_memory(
                    *buffer,
                    memory.memory(),
                    memory.base_offset() + offset,
                )
            }
            .map_err(|e| convert_result(e, "vkBindBufferMemory")),
            _ => Err(GraphicsError::InvalidParameter(
                "buffer and memory must both belong to the Vulkan backend".to_string(),
            )),
        }
    }

    pub fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[DescriptorPoolSize],
    ) -> Result<GpuDescriptorPool, GraphicsError> {
        let sizes: Vec<vk::DescriptorPoolSize> = pool_sizes
            .iter()
            .filter(|size| size.count > 0)
            .map(|size| vk::DescriptorPoolSize {
                ty: convert_descriptor_type(size.ty),
                descriptor_count: size.count,
            })
            .collect();

        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&sizes);

        let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| convert_result(e, "vkCreateDescriptorPool"))?;

        Ok(GpuDescriptorPool::Vulkan {
            device: self.device.clone(),
            pool,
        })
    }

    pub fn allocate_descriptor_set(
        &self,
        pool: &GpuDescriptorPool,
        layout: &DescriptorSetLayout,
    ) -> Result<GpuDescriptorSet, GraphicsError> {
        #[allow(irrefutable_let_patterns)]
        let GpuDescriptorPool::Vulkan { pool, .. } = pool else {
            return Err(GraphicsError::InvalidParameter(
                "descriptor pool does not belong to the Vulkan backend".to_string(),
            ));
        };

        let set_layouts = [self.set_layout(layout)?];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(*pool)
            .set_layouts(&set_layouts);

        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }.map_err(|e| {
            match e {
                // Headroom is tracked above; running out here means the
                // accounting disagrees with the driver.
                vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                    GraphicsError::Internal(format!("vkAllocateDescriptorSets: {:?}", e))
                }
                other => convert_result(other, "vkAllocateDescriptorSets"),
            }
        })?;

        sets.into_iter()
            .next()
            .map(|set| GpuDescriptorSet::Vulkan { set })
            .ok_or_else(|| {
                GraphicsError::ResourceCreationFailed(
                    "vkAllocateDescriptorSets returned nothing".to_string(),
                )
            })
    }

    fn set_layout(
        &self,
        layout: &DescriptorSetLayout,
    ) -> Result<vk::DescriptorSetLayout, GraphicsError> {
        let mut cache = self.set_layouts.lock();
        if let Some(handle) = cache.get(layout) {
            return Ok(*handle);
        }

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = layout
            .bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(convert_descriptor_type(binding.ty))
                    .descriptor_count(binding.count)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let handle = unsafe { self.device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| convert_result(e, "vkCreateDescriptorSetLayout"))?;

        cache.insert(layout.clone(), handle);
        Ok(handle)
    }

    pub fn create_fence(&self, signaled: bool) -> Result<GpuFence, GraphicsError> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };

        let fence_info = vk::FenceCreateInfo::default().flags(flags);
        let fence = unsafe { self.device.create_fence(&fence_info, None) }
            .map_err(|e| convert_result(e, "vkCreateFence"))?;

        Ok(GpuFence::Vulkan {
            device: self.device.clone(),
            fence,
        })
    }

    pub fn create_semaphore(&self) -> Result<GpuSemaphore, GraphicsError> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.device.create_semaphore(&semaphore_info, None) }
            .map_err(|e| convert_result(e, "vkCreateSemaphore"))?;

        Ok(GpuSemaphore::Vulkan {
            device: self.device.clone(),
            semaphore,
        })
    }

    /// Create a command buffer with its own pool, so buffers recorded on
    /// different threads never share a pool.
    pub fn create_command_buffer(
        &self,
        _queue: QueueKind,
        level: CommandBufferLevel,
    ) -> Result<GpuCommandBuffer, GraphicsError> {
        let pool = command::create_command_pool(&self.device, self.graphics_queue_family)?;
        let command_buffer = match command::allocate_command_buffer(&self.device, pool, level) {
            Ok(command_buffer) => command_buffer,
            Err(e) => {
                unsafe { self.device.destroy_command_pool(pool, None) };
                return Err(e);
            }
        };

        Ok(GpuCommandBuffer::Vulkan {
            device: self.device.clone(),
            pool,
            command_buffer,
            level,
        })
    }

    /// Submit to the graphics queue. Transfer work shares it.
    pub fn submit(&self, _queue: QueueKind, info: &SubmitInfo<'_>) -> Result<(), GraphicsError> {
        profile_scope!("vulkan_submit");

        #[allow(unreachable_patterns)]
        let command_buffers: Vec<vk::CommandBuffer> = info
            .command_buffers
            .iter()
            .filter_map(|cmd| match cmd {
                GpuCommandBuffer::Vulkan { command_buffer, .. } => Some(*command_buffer),
                _ => None,
            })
            .collect();

        let mut wait_semaphores = Vec::with_capacity(info.wait_semaphores.len());
        let mut wait_stages = Vec::with_capacity(info.wait_semaphores.len());
        for (semaphore, stage) in info.wait_semaphores {
            if let Some(handle) = vk_semaphore(semaphore) {
                wait_semaphores.push(handle);
                wait_stages.push(convert_pipeline_stage(*stage));
            }
        }

        let signal_semaphores: Vec<vk::Semaphore> = info
            .signal_semaphores
            .iter()
            .filter_map(|semaphore| vk_semaphore(semaphore))
            .collect();

        if command_buffers.len() != info.command_buffers.len()
            || wait_semaphores.len() != info.wait_semaphores.len()
            || signal_semaphores.len() != info.signal_semaphores.len()
        {
            return Err(GraphicsError::InvalidParameter(
                "submission mixes objects from another backend".to_string(),
            ));
        }

        #[allow(unreachable_patterns)]
        let fence = match info.fence {
            Some(GpuFence::Vulkan { fence, .. }) => *fence,
            Some(_) => {
                return Err(GraphicsError::InvalidParameter(
                    "fence does not belong to the Vulkan backend".to_string(),
                ));
            }
            None => vk::Fence::null(),
        };

        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .signal_semaphores(&signal_semaphores);

        let _guard = self.submit_lock.lock();
        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], fence)
        }
        .map_err(|e| convert_result(e, "vkQueueSubmit"))
    }

    pub fn wait_idle(&self) -> Result<(), GraphicsError> {
        let _guard = self.submit_lock.lock();
        unsafe { self.device.device_wait_idle() }
            .map_err(|e| convert_result(e, "vkDeviceWaitIdle"))
    }
}

fn vk_semaphore(semaphore: &GpuSemaphore) -> Option<vk::Semaphore> {
    #[allow(unreachable_patterns)]
    match semaphore {
        GpuSemaphore::Vulkan { semaphore, .. } => Some(*semaphore),
        _ => None,
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for (_, layout) in self.set_layouts.get_mut().drain() {
                self.device.destroy_descriptor_set_layout(layout, None);
            }

            // The allocator frees its memory through the device.
            if Arc::strong_count(&self.allocator) > 1 {
                log::warn!("Vulkan backend dropped while memory blocks are still alive");
            }
            ManuallyDrop::drop(&mut self.allocator);

            self.device.destroy_device(None);

            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

impl std::fmt::Debug for VulkanBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanBackend")
            .field("physical_device", &self.physical_device)
            .field("graphics_queue_family", &self.graphics_queue_family)
            .field("set_layouts", &self.set_layouts.lock().len())
            .finish_non_exhaustive()
    }
}
