//! Physical device selection and logical device creation.

use std::ffi::CStr;

use ash::vk;

use crate::error::GraphicsError;

/// Select the physical device to allocate from.
///
/// Prefers discrete GPUs, then the one with the most device-local memory.
pub fn select_physical_device(
    instance: &ash::Instance,
) -> Result<vk::PhysicalDevice, GraphicsError> {
    let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
        GraphicsError::InitializationFailed(format!(
            "Failed to enumerate physical devices: {:?}",
            e
        ))
    })?;

    let mut best: Option<(vk::PhysicalDevice, u64)> = None;

    for device in devices {
        if find_graphics_queue_family(instance, device).is_err() {
            continue;
        }

        let properties = unsafe { instance.get_physical_device_properties(device) };
        let memory = unsafe { instance.get_physical_device_memory_properties(device) };

        let device_local: u64 = memory
            .memory_heaps_as_slice()
            .iter()
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size)
            .sum();

        let mut score = device_local >> 20;
        if properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 1 << 40;
        } else if properties.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1 << 30;
        }

        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!(
            "Found GPU: {:?} (type: {:?}, device local: {} MiB)",
            device_name,
            properties.device_type,
            device_local >> 20
        );

        if best.is_none_or(|(_, best_score)| score > best_score) {
            best = Some((device, score));
        }
    }

    best.map(|(device, _)| device)
        .ok_or_else(|| GraphicsError::InitializationFailed("No Vulkan-capable GPU found".to_string()))
}

/// Find a queue family that supports graphics operations.
///
/// Graphics queues implicitly support transfer.
pub fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32, GraphicsError> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    queue_families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .map(|index| index as u32)
        .ok_or_else(|| {
            GraphicsError::InitializationFailed("No graphics queue family found".to_string())
        })
}

/// Create a logical device with a single graphics queue.
pub fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    graphics_queue_family: u32,
) -> Result<ash::Device, GraphicsError> {
    let queue_priorities = [1.0f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(graphics_queue_family)
        .queue_priorities(&queue_priorities)];

    let create_info = vk::DeviceCreateInfo::default().queue_create_infos(&queue_create_infos);

    unsafe { instance.create_device(physical_device, &create_info, None) }.map_err(|e| {
        GraphicsError::InitializationFailed(format!("Failed to create logical device: {:?}", e))
    })
}
