//! Vulkan command pool and buffer recording.

use ash::vk;

use crate::backend::{GpuBuffer, GpuCommandBuffer};
use crate::error::GraphicsError;
use crate::types::{CommandBufferLevel, CopyRegion};

use super::conversion::convert_result;

/// Create a command pool whose buffers can be reset individually.
pub fn create_command_pool(
    device: &ash::Device,
    queue_family_index: u32,
) -> Result<vk::CommandPool, GraphicsError> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .queue_family_index(queue_family_index)
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

    unsafe { device.create_command_pool(&pool_info, None) }
        .map_err(|e| convert_result(e, "vkCreateCommandPool"))
}

/// Allocate one command buffer of `level` from `pool`.
pub fn allocate_command_buffer(
    device: &ash::Device,
    pool: vk::CommandPool,
    level: CommandBufferLevel,
) -> Result<vk::CommandBuffer, GraphicsError> {
    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(pool)
        .level(match level {
            CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
        })
        .command_buffer_count(1);

    let buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
        .map_err(|e| convert_result(e, "vkAllocateCommandBuffers"))?;

    buffers.into_iter().next().ok_or_else(|| {
        GraphicsError::ResourceCreationFailed("vkAllocateCommandBuffers returned nothing".into())
    })
}

/// Reset and begin recording.
///
/// Secondaries are recorded outside a render pass, so they inherit nothing.
pub fn begin(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    level: CommandBufferLevel,
) -> Result<(), GraphicsError> {
    unsafe { device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty()) }
        .map_err(|e| convert_result(e, "vkResetCommandBuffer"))?;

    let inheritance = vk::CommandBufferInheritanceInfo::default();
    let mut begin_info = vk::CommandBufferBeginInfo::default()
        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    if level == CommandBufferLevel::Secondary {
        begin_info = begin_info.inheritance_info(&inheritance);
    }

    unsafe { device.begin_command_buffer(command_buffer, &begin_info) }
        .map_err(|e| convert_result(e, "vkBeginCommandBuffer"))
}

fn vk_buffer(buffer: &GpuBuffer) -> Option<vk::Buffer> {
    #[allow(unreachable_patterns)]
    match buffer {
        GpuBuffer::Vulkan { buffer, .. } => Some(*buffer),
        _ => None,
    }
}

pub fn copy_buffer(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    src: &GpuBuffer,
    dst: &GpuBuffer,
    regions: &[CopyRegion],
) {
    let (Some(src), Some(dst)) = (vk_buffer(src), vk_buffer(dst)) else {
        log::error!("copy_buffer: buffers do not belong to the Vulkan backend");
        return;
    };

    let regions: Vec<vk::BufferCopy> = regions
        .iter()
        .map(|region| vk::BufferCopy {
            src_offset: region.src_offset,
            dst_offset: region.dst_offset,
            size: region.size,
        })
        .collect();

    unsafe { device.cmd_copy_buffer(command_buffer, src, dst, &regions) };
}

pub fn fill_buffer(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    dst: &GpuBuffer,
    offset: u64,
    size: u64,
    value: u32,
) {
    let Some(dst) = vk_buffer(dst) else {
        log::error!("fill_buffer: buffer does not belong to the Vulkan backend");
        return;
    };

    unsafe { device.cmd_fill_buffer(command_buffer, dst, offset, size, value) };
}

pub fn execute_commands(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    secondaries: &[&GpuCommandBuffer],
) {
    #[allow(unreachable_patterns)]
    let handles: Vec<vk::CommandBuffer> = secondaries
        .iter()
        .filter_map(|secondary| match secondary {
            GpuCommandBuffer::Vulkan { command_buffer, .. } => Some(*command_buffer),
            _ => None,
        })
        .collect();

    if handles.len() != secondaries.len() {
        log::error!("execute_commands: secondaries do not belong to the Vulkan backend");
        return;
    }
    if handles.is_empty() {
        return;
    }

    unsafe { device.cmd_execute_commands(command_buffer, &handles) };
}
