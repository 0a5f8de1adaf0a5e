//! Pool growth preferences and resource requirement summaries.

use std::collections::BTreeMap;

use crate::types::{DescriptorPoolSize, DescriptorSetLayout, DescriptorType};

/// Sizing policy for pool growth.
///
/// When a pool has no arena with room for a request it creates one sized to
/// the larger of the request and the matching minimum here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePreferences {
    /// Minimum size of a new buffer arena.
    pub minimum_buffer_size: u64,
    /// Minimum size of a new device memory block.
    pub minimum_device_memory_size: u64,
    /// Minimum number of sets in a new descriptor pool.
    pub minimum_max_sets: u32,
    /// Minimum number of descriptors per type in a new descriptor pool.
    pub minimum_descriptor_pool_size: u32,
    /// Cap on the total device memory the pools may allocate.
    pub allocated_memory_limit: Option<u64>,
}

impl Default for ResourcePreferences {
    fn default() -> Self {
        Self {
            minimum_buffer_size: 1024 * 1024,
            minimum_device_memory_size: 16 * 1024 * 1024,
            minimum_max_sets: 64,
            minimum_descriptor_pool_size: 64,
            allocated_memory_limit: None,
        }
    }
}

impl ResourcePreferences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_minimum_buffer_size(mut self, size: u64) -> Self {
        self.minimum_buffer_size = size;
        self
    }

    pub fn with_minimum_device_memory_size(mut self, size: u64) -> Self {
        self.minimum_device_memory_size = size;
        self
    }

    pub fn with_minimum_max_sets(mut self, max_sets: u32) -> Self {
        self.minimum_max_sets = max_sets;
        self
    }

    pub fn with_minimum_descriptor_pool_size(mut self, count: u32) -> Self {
        self.minimum_descriptor_pool_size = count;
        self
    }

    pub fn with_allocated_memory_limit(mut self, limit: u64) -> Self {
        self.allocated_memory_limit = Some(limit);
        self
    }
}

/// Descriptor demand of a batch of objects about to be compiled.
///
/// Accumulated while walking the objects, then handed to
/// [`DescriptorPools::reserve`](super::DescriptorPools::reserve) so the pools
/// grow once up front instead of once per set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRequirements {
    num_descriptor_sets: u32,
    descriptor_type_counts: BTreeMap<DescriptorType, u32>,
}

impl ResourceRequirements {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requirements of a single set of `layout`.
    pub fn for_layout(layout: &DescriptorSetLayout) -> Self {
        let mut requirements = Self::new();
        requirements.add_descriptor_set(layout);
        requirements
    }

    /// Count one descriptor set of `layout`.
    pub fn add_descriptor_set(&mut self, layout: &DescriptorSetLayout) {
        self.add_descriptor_sets(layout, 1);
    }

    /// Count `count` descriptor sets of `layout`.
    pub fn add_descriptor_sets(&mut self, layout: &DescriptorSetLayout, count: u32) {
        self.num_descriptor_sets = self.num_descriptor_sets.saturating_add(count);
        for binding in &layout.bindings {
            let total = self.descriptor_type_counts.entry(binding.ty).or_insert(0);
            *total = total.saturating_add(binding.count.saturating_mul(count));
        }
    }

    /// Add another summary into this one.
    pub fn merge(&mut self, other: &ResourceRequirements) {
        self.num_descriptor_sets = self
            .num_descriptor_sets
            .saturating_add(other.num_descriptor_sets);
        for (ty, count) in &other.descriptor_type_counts {
            let total = self.descriptor_type_counts.entry(*ty).or_insert(0);
            *total = total.saturating_add(*count);
        }
    }

    /// Sets needed.
    pub fn compute_num_descriptor_sets(&self) -> u32 {
        self.num_descriptor_sets
    }

    /// Descriptors needed per type, sorted by type, zero counts omitted.
    pub fn compute_descriptor_pool_sizes(&self) -> Vec<DescriptorPoolSize> {
        self.descriptor_type_counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(ty, count)| DescriptorPoolSize::new(*ty, *count))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.num_descriptor_sets == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn material_layout() -> DescriptorSetLayout {
        DescriptorSetLayout::default()
            .with_binding(0, DescriptorType::UniformBuffer, 1)
            .with_binding(1, DescriptorType::CombinedImageSampler, 4)
    }

    #[test]
    fn test_accumulates_sets_and_types() {
        let mut requirements = ResourceRequirements::new();
        requirements.add_descriptor_sets(&material_layout(), 3);
        requirements.add_descriptor_set(
            &DescriptorSetLayout::default().with_binding(0, DescriptorType::StorageBuffer, 2),
        );

        assert_eq!(requirements.compute_num_descriptor_sets(), 4);
        assert_eq!(
            requirements.compute_descriptor_pool_sizes(),
            vec![
                DescriptorPoolSize::new(DescriptorType::CombinedImageSampler, 12),
                DescriptorPoolSize::new(DescriptorType::UniformBuffer, 3),
                DescriptorPoolSize::new(DescriptorType::StorageBuffer, 2),
            ]
        );
    }

    #[test]
    fn test_merge() {
        let mut a = ResourceRequirements::for_layout(&material_layout());
        let b = ResourceRequirements::for_layout(&material_layout());
        a.merge(&b);
        assert_eq!(a.compute_num_descriptor_sets(), 2);
        assert_eq!(a.compute_descriptor_pool_sizes()[1].count, 2);
    }

    #[test]
    fn test_large_batches_saturate() {
        let mut requirements = ResourceRequirements::new();
        requirements.add_descriptor_sets(&material_layout(), u32::MAX);
        requirements.add_descriptor_sets(&material_layout(), 2);
        let other = requirements.clone();
        requirements.merge(&other);

        assert_eq!(requirements.compute_num_descriptor_sets(), u32::MAX);
        assert!(
            requirements
                .compute_descriptor_pool_sizes()
                .iter()
                .all(|size| size.count == u32::MAX)
        );
    }

    #[test]
    fn test_preferences_builder() {
        let preferences = ResourcePreferences::new()
            .with_minimum_buffer_size(4096)
            .with_allocated_memory_limit(1 << 20);
        assert_eq!(preferences.minimum_buffer_size, 4096);
        assert_eq!(preferences.minimum_device_memory_size, 16 * 1024 * 1024);
        assert_eq!(preferences.allocated_memory_limit, Some(1 << 20));
    }
}
