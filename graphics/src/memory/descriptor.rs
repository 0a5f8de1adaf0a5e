//! Descriptor pool growth and descriptor set leases.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use arbor_core::profiling::profile_scope;
use parking_lot::Mutex;

use crate::backend::{GpuBackend, GpuDescriptorPool, GpuDescriptorSet};
use crate::error::GraphicsError;
use crate::types::{DescriptorPoolSize, DescriptorSetLayout, DescriptorType};

use super::{ResourcePreferences, ResourceRequirements};

#[derive(Debug)]
struct DescriptorPoolState {
    available_sets: u32,
    available: BTreeMap<DescriptorType, u32>,
    recycled: HashMap<DescriptorSetLayout, Vec<GpuDescriptorSet>>,
}

/// A descriptor pool with headroom tracking.
///
/// `available_sets` and the per-type counts shrink as sets are allocated.
/// A released set is kept for reuse by the next allocation of the same
/// layout instead of being handed back to the driver, so headroom is not
/// restored on release.
pub struct DescriptorPool {
    id: u64,
    gpu: GpuDescriptorPool,
    max_sets: u32,
    state: Mutex<DescriptorPoolState>,
}

impl DescriptorPool {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn max_sets(&self) -> u32 {
        self.max_sets
    }

    /// Sets that may still be allocated fresh from the pool.
    pub fn available_sets(&self) -> u32 {
        self.state.lock().available_sets
    }

    /// Descriptors of `ty` still available.
    pub fn available_descriptors(&self, ty: DescriptorType) -> u32 {
        self.state.lock().available.get(&ty).copied().unwrap_or(0)
    }

    /// Number of released sets waiting for reuse.
    pub fn recycled_count(&self) -> usize {
        self.state.lock().recycled.values().map(Vec::len).sum()
    }

    fn take_recycled(&self, layout: &DescriptorSetLayout) -> Option<GpuDescriptorSet> {
        self.state.lock().recycled.get_mut(layout)?.pop()
    }

    /// Whether the pool alone can still hold `sets` sets and `sizes` descriptors.
    fn has_headroom(&self, sets: u32, sizes: &[DescriptorPoolSize]) -> bool {
        let state = self.state.lock();
        state.available_sets >= sets
            && sizes
                .iter()
                .all(|size| state.available.get(&size.ty).copied().unwrap_or(0) >= size.count)
    }

    /// Reserve headroom for one set of `layout`, or report that it lacks room.
    fn reserve_headroom(&self, layout: &DescriptorSetLayout) -> bool {
        let mut state = self.state.lock();
        if state.available_sets == 0 {
            return false;
        }
        let sizes = layout.pool_sizes();
        let fits = sizes
            .iter()
            .all(|size| state.available.get(&size.ty).copied().unwrap_or(0) >= size.count);
        if !fits {
            return false;
        }
        state.available_sets -= 1;
        for size in sizes {
            if let Some(available) = state.available.get_mut(&size.ty) {
                *available -= size.count;
            }
        }
        true
    }

    fn recycle(&self, layout: DescriptorSetLayout, set: GpuDescriptorSet) {
        self.state.lock().recycled.entry(layout).or_default().push(set);
    }
}

impl std::fmt::Debug for DescriptorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DescriptorPool")
            .field("id", &self.id)
            .field("max_sets", &self.max_sets)
            .field("available_sets", &state.available_sets)
            .field("available", &state.available)
            .finish()
    }
}

/// A descriptor set allocated from a [`DescriptorPool`].
///
/// Like a buffer lease, it is move-only and releases on drop; releasing
/// twice is a no-op.
pub struct DescriptorSetLease {
    pool: Weak<DescriptorPool>,
    set: Option<GpuDescriptorSet>,
    layout: DescriptorSetLayout,
}

impl DescriptorSetLease {
    pub fn set(&self) -> Option<GpuDescriptorSet> {
        self.set
    }

    pub fn layout(&self) -> &DescriptorSetLayout {
        &self.layout
    }

    pub fn pool(&self) -> Option<Arc<DescriptorPool>> {
        self.pool.upgrade()
    }

    pub fn is_valid(&self) -> bool {
        self.set.is_some() && self.pool.strong_count() > 0
    }

    pub fn release(&mut self) {
        if let Some(set) = self.set.take()
            && let Some(pool) = self.pool.upgrade()
        {
            pool.recycle(self.layout.clone(), set);
        }
        self.pool = Weak::new();
    }
}

impl Drop for DescriptorSetLease {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for DescriptorSetLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLease")
            .field("set", &self.set)
            .field("layout", &self.layout)
            .finish()
    }
}

/// Growing collection of descriptor pools.
pub struct DescriptorPools {
    backend: Arc<GpuBackend>,
    preferences: ResourcePreferences,
    pools: Mutex<Vec<Arc<DescriptorPool>>>,
    next_id: AtomicU64,
}

impl DescriptorPools {
    pub fn new(backend: Arc<GpuBackend>, preferences: ResourcePreferences) -> Self {
        Self {
            backend,
            preferences,
            pools: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Make sure the pools can satisfy `requirements` without further growth.
    ///
    /// Sets are allocated from one pool at a time, so the request is covered
    /// only when a single pool has headroom for the set count and every
    /// descriptor type. Otherwise one pool sized to the whole request, up to
    /// the configured minimums, is created.
    pub fn reserve(&self, requirements: &ResourceRequirements) -> Result<(), GraphicsError> {
        profile_scope!("DescriptorPools::reserve");

        if requirements.is_empty() {
            return Ok(());
        }

        let mut pools = self.pools.lock();

        let required_sets = requirements.compute_num_descriptor_sets();
        let required_sizes = requirements.compute_descriptor_pool_sizes();
        if pools
            .iter()
            .any(|pool| pool.has_headroom(required_sets, &required_sizes))
        {
            return Ok(());
        }

        let max_sets = required_sets.max(self.preferences.minimum_max_sets);
        let pool_sizes: Vec<DescriptorPoolSize> = required_sizes
            .iter()
            .map(|size| {
                DescriptorPoolSize::new(
                    size.ty,
                    size.count.max(self.preferences.minimum_descriptor_pool_size),
                )
            })
            .collect();

        let pool = self.create_pool(max_sets, &pool_sizes)?;
        pools.push(pool);
        Ok(())
    }

    /// Allocate a set of `layout`, reusing a released set when one exists.
    pub fn allocate_descriptor_set(
        &self,
        layout: &DescriptorSetLayout,
    ) -> Result<DescriptorSetLease, GraphicsError> {
        profile_scope!("DescriptorPools::allocate_descriptor_set");

        let mut pools = self.pools.lock();

        for pool in pools.iter() {
            if let Some(set) = pool.take_recycled(layout) {
                return Ok(Self::lease(pool, set, layout));
            }
        }

        for pool in pools.iter() {
            if pool.reserve_headroom(layout) {
                let set = self.backend.allocate_descriptor_set(&pool.gpu, layout)?;
                return Ok(Self::lease(pool, set, layout));
            }
        }

        let sizes: Vec<DescriptorPoolSize> = layout
            .pool_sizes()
            .into_iter()
            .map(|size| {
                DescriptorPoolSize::new(
                    size.ty,
                    size.count.max(self.preferences.minimum_descriptor_pool_size),
                )
            })
            .collect();
        let pool = self.create_pool(self.preferences.minimum_max_sets.max(1), &sizes)?;
        if !pool.reserve_headroom(layout) {
            return Err(GraphicsError::Internal(format!(
                "new descriptor pool {} cannot hold a set of {layout:?}",
                pool.id
            )));
        }
        let set = self.backend.allocate_descriptor_set(&pool.gpu, layout)?;
        pools.push(Arc::clone(&pool));
        Ok(Self::lease(&pool, set, layout))
    }

    pub fn pool_count(&self) -> usize {
        self.pools.lock().len()
    }

    /// Free sets across all pools.
    pub fn available_sets(&self) -> u32 {
        self.pools.lock().iter().map(|pool| pool.available_sets()).sum()
    }

    /// Free descriptors of `ty` across all pools.
    pub fn available_descriptors(&self, ty: DescriptorType) -> u32 {
        self.pools
            .lock()
            .iter()
            .map(|pool| pool.available_descriptors(ty))
            .sum()
    }

    pub fn report(&self) {
        let pools = self.pools.lock();
        log::debug!("DescriptorPools: {} pools", pools.len());
        for pool in pools.iter() {
            log::debug!("  {pool:?}");
        }
    }

    fn create_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[DescriptorPoolSize],
    ) -> Result<Arc<DescriptorPool>, GraphicsError> {
        let gpu = self.backend.create_descriptor_pool(max_sets, pool_sizes)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!("DescriptorPools: new pool {id} with {max_sets} sets, {pool_sizes:?}");
        Ok(Arc::new(DescriptorPool {
            id,
            gpu,
            max_sets,
            state: Mutex::new(DescriptorPoolState {
                available_sets: max_sets,
                available: pool_sizes.iter().map(|size| (size.ty, size.count)).collect(),
                recycled: HashMap::new(),
            }),
        }))
    }

    fn lease(
        pool: &Arc<DescriptorPool>,
        set: GpuDescriptorSet,
        layout: &DescriptorSetLayout,
    ) -> DescriptorSetLease {
        DescriptorSetLease {
            pool: Arc::downgrade(pool),
            set: Some(set),
            layout: layout.clone(),
        }
    }
}

impl std::fmt::Debug for DescriptorPools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorPools")
            .field("pools", &self.pool_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(DescriptorPools: Send, Sync);
static_assertions::assert_impl_all!(DescriptorSetLease: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    fn pools() -> DescriptorPools {
        DescriptorPools::new(
            Arc::new(GpuBackend::Dummy(DummyBackend::new())),
            ResourcePreferences::new()
                .with_minimum_max_sets(4)
                .with_minimum_descriptor_pool_size(4),
        )
    }

    fn uniform_layout() -> DescriptorSetLayout {
        DescriptorSetLayout::default().with_binding(0, DescriptorType::UniformBuffer, 1)
    }

    #[test]
    fn test_reserve_creates_pool_for_shortfall() {
        let pools = pools();
        let mut requirements = ResourceRequirements::new();
        requirements.add_descriptor_sets(&uniform_layout(), 10);

        pools.reserve(&requirements).unwrap();
        assert_eq!(pools.pool_count(), 1);
        assert_eq!(pools.available_sets(), 10);
        assert_eq!(pools.available_descriptors(DescriptorType::UniformBuffer), 10);

        // Already covered.
        pools.reserve(&requirements).unwrap();
        assert_eq!(pools.pool_count(), 1);
    }

    #[test]
    fn test_reserve_uses_minimums() {
        let pools = pools();
        pools
            .reserve(&ResourceRequirements::for_layout(&uniform_layout()))
            .unwrap();
        assert_eq!(pools.available_sets(), 4);
        assert_eq!(pools.available_descriptors(DescriptorType::UniformBuffer), 4);
    }

    #[test]
    fn test_allocation_after_reserve_does_not_grow() {
        let pools = pools();
        let mut requirements = ResourceRequirements::new();
        requirements.add_descriptor_sets(&uniform_layout(), 6);
        pools.reserve(&requirements).unwrap();

        let leases: Vec<_> = (0..6)
            .map(|_| pools.allocate_descriptor_set(&uniform_layout()).unwrap())
            .collect();
        assert_eq!(pools.pool_count(), 1);
        assert_eq!(pools.available_sets(), 0);
        assert!(leases.iter().all(DescriptorSetLease::is_valid));
    }

    #[test]
    fn test_allocation_grows_when_exhausted() {
        let pools = pools();
        let _leases: Vec<_> = (0..5)
            .map(|_| pools.allocate_descriptor_set(&uniform_layout()).unwrap())
            .collect();
        assert_eq!(pools.pool_count(), 2);
    }

    #[test]
    fn test_released_set_is_reused() {
        let pools = pools();
        let mut lease = pools.allocate_descriptor_set(&uniform_layout()).unwrap();
        let set = lease.set();
        lease.release();
        lease.release();
        assert!(!lease.is_valid());

        let again = pools.allocate_descriptor_set(&uniform_layout()).unwrap();
        assert_eq!(again.set(), set);
        assert_eq!(pools.available_sets(), 3);
    }

    #[test]
    fn test_headroom_split_across_pools_is_not_enough() {
        let pools = pools();
        let storage = DescriptorSetLayout::default().with_binding(0, DescriptorType::StorageBuffer, 1);
        let mixed = DescriptorSetLayout::default()
            .with_binding(0, DescriptorType::UniformBuffer, 1)
            .with_binding(1, DescriptorType::StorageBuffer, 1);

        pools
            .reserve(&ResourceRequirements::for_layout(&uniform_layout()))
            .unwrap();
        pools.reserve(&ResourceRequirements::for_layout(&storage)).unwrap();
        assert_eq!(pools.pool_count(), 2);

        // Each type has headroom somewhere, but in no single pool.
        pools.reserve(&ResourceRequirements::for_layout(&mixed)).unwrap();
        assert_eq!(pools.pool_count(), 3);

        let lease = pools.allocate_descriptor_set(&mixed).unwrap();
        assert!(lease.is_valid());
        assert_eq!(pools.pool_count(), 3);
    }

    #[test]
    fn test_type_shortfall_alone_grows() {
        let pools = pools();
        pools
            .reserve(&ResourceRequirements::for_layout(&uniform_layout()))
            .unwrap();
        let storage = DescriptorSetLayout::default().with_binding(0, DescriptorType::StorageBuffer, 2);
        pools.reserve(&ResourceRequirements::for_layout(&storage)).unwrap();
        assert_eq!(pools.pool_count(), 2);
        assert_eq!(pools.available_descriptors(DescriptorType::StorageBuffer), 4);
    }
}
