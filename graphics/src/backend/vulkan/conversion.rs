//! Type conversions between Arbor types and Vulkan types.

use ash::vk;

use crate::error::GraphicsError;
use crate::types::{BufferUsage, DescriptorType, MemoryProperties, PipelineStage, SharingMode};

/// Convert BufferUsage flags to Vulkan buffer usage flags.
pub fn convert_buffer_usage(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut result = vk::BufferUsageFlags::empty();

    if usage.contains(BufferUsage::VERTEX) {
        result |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        result |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        result |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.contains(BufferUsage::STORAGE) {
        result |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        result |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        result |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(BufferUsage::COPY_DST) {
        result |= vk::BufferUsageFlags::TRANSFER_DST;
    }

    result
}

pub fn convert_sharing_mode(mode: SharingMode) -> vk::SharingMode {
    match mode {
        SharingMode::Exclusive => vk::SharingMode::EXCLUSIVE,
        SharingMode::Concurrent => vk::SharingMode::CONCURRENT,
    }
}

/// Convert PipelineStage flags to Vulkan pipeline stage flags.
pub fn convert_pipeline_stage(stage: PipelineStage) -> vk::PipelineStageFlags {
    let mut result = vk::PipelineStageFlags::empty();

    if stage.contains(PipelineStage::TOP_OF_PIPE) {
        result |= vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    if stage.contains(PipelineStage::DRAW_INDIRECT) {
        result |= vk::PipelineStageFlags::DRAW_INDIRECT;
    }
    if stage.contains(PipelineStage::VERTEX_INPUT) {
        result |= vk::PipelineStageFlags::VERTEX_INPUT;
    }
    if stage.contains(PipelineStage::VERTEX_SHADER) {
        result |= vk::PipelineStageFlags::VERTEX_SHADER;
    }
    if stage.contains(PipelineStage::FRAGMENT_SHADER) {
        result |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if stage.contains(PipelineStage::COLOR_ATTACHMENT_OUTPUT) {
        result |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    }
    if stage.contains(PipelineStage::COMPUTE_SHADER) {
        result |= vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    if stage.contains(PipelineStage::TRANSFER) {
        result |= vk::PipelineStageFlags::TRANSFER;
    }
    if stage.contains(PipelineStage::BOTTOM_OF_PIPE) {
        result |= vk::PipelineStageFlags::BOTTOM_OF_PIPE;
    }
    if stage.contains(PipelineStage::ALL_COMMANDS) {
        result |= vk::PipelineStageFlags::ALL_COMMANDS;
    }

    // A wait stage of zero is invalid in Vulkan.
    if result.is_empty() {
        vk::PipelineStageFlags::ALL_COMMANDS
    } else {
        result
    }
}

pub fn convert_descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorType::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        DescriptorType::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
        DescriptorType::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
        DescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        DescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorType::UniformBufferDynamic => vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
        DescriptorType::StorageBufferDynamic => vk::DescriptorType::STORAGE_BUFFER_DYNAMIC,
    }
}

/// Pick a gpu-allocator memory location for the requested properties.
pub fn convert_memory_location(properties: MemoryProperties) -> gpu_allocator::MemoryLocation {
    if properties.contains(MemoryProperties::HOST_CACHED) {
        gpu_allocator::MemoryLocation::GpuToCpu
    } else if properties.contains(MemoryProperties::HOST_VISIBLE) {
        gpu_allocator::MemoryLocation::CpuToGpu
    } else {
        gpu_allocator::MemoryLocation::GpuOnly
    }
}

/// Map a failed Vulkan call to a [`GraphicsError`].
///
/// Device loss and memory exhaustion keep their identity; everything else
/// carries the failing call's name.
pub fn convert_result(result: vk::Result, context: &str) -> GraphicsError {
    match result {
        vk::Result::ERROR_DEVICE_LOST => GraphicsError::DeviceLost,
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            GraphicsError::OutOfDeviceMemory(format!("{context}: {result:?}"))
        }
        _ if context.starts_with("vkQueueSubmit") => {
            GraphicsError::SubmitFailed(format!("{context}: {result:?}"))
        }
        _ => GraphicsError::ResourceCreationFailed(format!("{context}: {result:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_usage_conversion() {
        let flags = convert_buffer_usage(BufferUsage::UNIFORM | BufferUsage::COPY_DST);
        assert_eq!(
            flags,
            vk::BufferUsageFlags::UNIFORM_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
    }

    #[test]
    fn test_empty_stage_waits_on_all_commands() {
        assert_eq!(
            convert_pipeline_stage(PipelineStage::empty()),
            vk::PipelineStageFlags::ALL_COMMANDS
        );
    }

    #[test]
    fn test_result_mapping() {
        assert_eq!(
            convert_result(vk::Result::ERROR_DEVICE_LOST, "vkQueueSubmit"),
            GraphicsError::DeviceLost
        );
        assert!(matches!(
            convert_result(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY, "vkAllocateMemory"),
            GraphicsError::OutOfDeviceMemory(_)
        ));
        assert!(matches!(
            convert_result(vk::Result::ERROR_UNKNOWN, "vkQueueSubmit"),
            GraphicsError::SubmitFailed(_)
        ));
    }
}
