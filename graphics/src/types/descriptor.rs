//! Descriptor set layouts and pool sizing.

/// Kind of resource bound through a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DescriptorType {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformBuffer,
    StorageBuffer,
    UniformBufferDynamic,
    StorageBufferDynamic,
}

/// One binding slot of a descriptor set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
}

impl DescriptorBinding {
    pub fn new(binding: u32, ty: DescriptorType, count: u32) -> Self {
        Self { binding, ty, count }
    }
}

/// Shape of a descriptor set: its bindings.
///
/// Two layouts with identical bindings are interchangeable, so freed sets
/// are recycled across them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DescriptorSetLayout {
    pub bindings: Vec<DescriptorBinding>,
}

impl DescriptorSetLayout {
    pub fn new(bindings: Vec<DescriptorBinding>) -> Self {
        Self { bindings }
    }

    /// Add a binding.
    pub fn with_binding(mut self, binding: u32, ty: DescriptorType, count: u32) -> Self {
        self.bindings.push(DescriptorBinding::new(binding, ty, count));
        self
    }

    /// Descriptor counts per type, merged and sorted by type.
    pub fn pool_sizes(&self) -> Vec<DescriptorPoolSize> {
        let mut sizes: Vec<DescriptorPoolSize> = Vec::new();
        for binding in &self.bindings {
            match sizes.iter_mut().find(|s| s.ty == binding.ty) {
                Some(size) => size.count += binding.count,
                None => sizes.push(DescriptorPoolSize::new(binding.ty, binding.count)),
            }
        }
        sizes.sort_by_key(|s| s.ty);
        sizes
    }
}

/// Number of descriptors of one type a pool can hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorPoolSize {
    pub ty: DescriptorType,
    pub count: u32,
}

impl DescriptorPoolSize {
    pub fn new(ty: DescriptorType, count: u32) -> Self {
        Self { ty, count }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizes_merge_by_type() {
        let layout = DescriptorSetLayout::default()
            .with_binding(0, DescriptorType::UniformBuffer, 1)
            .with_binding(1, DescriptorType::CombinedImageSampler, 2)
            .with_binding(2, DescriptorType::UniformBuffer, 3);

        let sizes = layout.pool_sizes();
        assert_eq!(
            sizes,
            vec![
                DescriptorPoolSize::new(DescriptorType::CombinedImageSampler, 2),
                DescriptorPoolSize::new(DescriptorType::UniformBuffer, 4),
            ]
        );
    }
}
