//! Leases: reserved ranges inside pooled arenas.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::GraphicsError;
use crate::resources::{Buffer, DeviceMemory};

use super::{DynamicData, MemorySlots};

/// A resource whose byte range is sub-allocated.
pub trait Arena: Send + Sync {
    /// Free/reserved bookkeeping of the arena.
    fn slots(&self) -> &Mutex<MemorySlots>;
}

/// A reserved `(offset, range)` inside an arena.
///
/// Leases hold only a weak reference to their arena; the pool owns it.
/// Releasing returns the range to the arena and empties the lease, so a
/// second release is a no-op. Dropping a lease releases it.
///
/// A lease is move-only: copying it would let two owners release the same
/// range, the second of which could free someone else's reservation. Wrap a
/// lease in an `Arc` to share it.
pub struct Lease<R: Arena> {
    resource: Weak<R>,
    offset: u64,
    range: u64,
    data: Option<Arc<DynamicData>>,
}

/// A range of a pooled [`Buffer`].
pub type BufferLease = Lease<Buffer>;

/// A range of a pooled [`DeviceMemory`] block.
pub type MemoryLease = Lease<DeviceMemory>;

impl<R: Arena> Lease<R> {
    pub(crate) fn new(resource: &Arc<R>, offset: u64, range: u64) -> Self {
        Self {
            resource: Arc::downgrade(resource),
            offset,
            range,
            data: None,
        }
    }

    /// Attach CPU-side data to upload into this range.
    pub fn with_data(mut self, data: Arc<DynamicData>) -> Self {
        self.data = Some(data);
        self
    }

    pub fn set_data(&mut self, data: Option<Arc<DynamicData>>) {
        self.data = data;
    }

    /// The arena, if it still exists.
    pub fn resource(&self) -> Option<Arc<R>> {
        self.resource.upgrade()
    }

    /// Byte offset of the range in the arena.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Length of the range in bytes.
    pub fn range(&self) -> u64 {
        self.range
    }

    pub fn data(&self) -> Option<&Arc<DynamicData>> {
        self.data.as_ref()
    }

    /// Whether the lease refers to a live arena and a non-empty range.
    pub fn is_valid(&self) -> bool {
        self.range > 0 && self.resource.strong_count() > 0
    }

    /// Return the range to the arena and empty the lease.
    ///
    /// Safe to call any number of times.
    pub fn release(&mut self) {
        if self.range == 0 {
            return;
        }
        if let Some(resource) = self.resource.upgrade() {
            resource.slots().lock().release(self.offset, self.range);
        }
        self.resource = Weak::new();
        self.offset = 0;
        self.range = 0;
        self.data = None;
    }
}

impl Lease<Buffer> {
    /// The buffer, if it still exists.
    pub fn buffer(&self) -> Option<Arc<Buffer>> {
        self.resource()
    }

    /// Write `data` at `offset` bytes into the leased range.
    ///
    /// The buffer must live in host-visible memory.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), GraphicsError> {
        if offset.checked_add(data.len() as u64).is_none_or(|end| end > self.range) {
            return Err(GraphicsError::InvalidParameter(format!(
                "write of {} bytes at {offset} overruns a {} byte lease",
                data.len(),
                self.range
            )));
        }
        let buffer = self.buffer().ok_or_else(|| {
            GraphicsError::InvalidParameter("write through an empty lease".to_string())
        })?;
        buffer.write(self.offset + offset, data)
    }

    /// Read bytes at `offset` in the leased range through the host mapping.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<(), GraphicsError> {
        if offset.checked_add(out.len() as u64).is_none_or(|end| end > self.range) {
            return Err(GraphicsError::InvalidParameter(format!(
                "read of {} bytes at {offset} overruns a {} byte lease",
                out.len(),
                self.range
            )));
        }
        let buffer = self.buffer().ok_or_else(|| {
            GraphicsError::InvalidParameter("read through an empty lease".to_string())
        })?;
        buffer.read(self.offset + offset, out)
    }
}

impl Lease<DeviceMemory> {
    /// The memory block, if it still exists.
    pub fn memory(&self) -> Option<Arc<DeviceMemory>> {
        self.resource()
    }
}

impl<R: Arena> Default for Lease<R> {
    fn default() -> Self {
        Self {
            resource: Weak::new(),
            offset: 0,
            range: 0,
            data: None,
        }
    }
}

impl<R: Arena> Drop for Lease<R> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<R: Arena> std::fmt::Debug for Lease<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("offset", &self.offset)
            .field("range", &self.range)
            .field("valid", &self.is_valid())
            .field("has_data", &self.data.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestArena {
        slots: Mutex<MemorySlots>,
    }

    impl Arena for TestArena {
        fn slots(&self) -> &Mutex<MemorySlots> {
            &self.slots
        }
    }

    fn arena(size: u64) -> Arc<TestArena> {
        Arc::new(TestArena {
            slots: Mutex::new(MemorySlots::new(size)),
        })
    }

    fn lease(arena: &Arc<TestArena>, size: u64) -> Lease<TestArena> {
        let offset = arena.slots.lock().reserve(size, 1).unwrap();
        Lease::new(arena, offset, size)
    }

    #[test]
    fn test_default_lease_is_empty() {
        let mut lease = Lease::<TestArena>::default();
        assert!(!lease.is_valid());
        assert!(lease.resource().is_none());
        lease.release();
        assert_eq!(lease.range(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let arena = arena(256);
        let mut first = lease(&arena, 100);
        assert!(first.is_valid());

        first.release();
        assert!(!first.is_valid());
        assert_eq!(arena.slots.lock().total_reserved_size(), 0);

        // The range is handed out again; releasing the stale lease must not free it.
        let second = lease(&arena, 100);
        assert_eq!(second.offset(), 0);
        first.release();
        assert_eq!(arena.slots.lock().total_reserved_size(), 100);
    }

    #[test]
    fn test_drop_releases() {
        let arena = arena(256);
        {
            let _lease = lease(&arena, 64);
            assert_eq!(arena.slots.lock().total_reserved_size(), 64);
        }
        assert_eq!(arena.slots.lock().total_reserved_size(), 0);
    }

    #[test]
    fn test_lease_outliving_arena() {
        let arena = arena(256);
        let mut lease = lease(&arena, 64);
        drop(arena);
        assert!(!lease.is_valid());
        lease.release();
    }

    #[test]
    fn test_release_drops_data() {
        let arena = arena(256);
        let data = Arc::new(DynamicData::zeroed(16));
        let mut lease = lease(&arena, 16).with_data(Arc::clone(&data));
        assert_eq!(Arc::strong_count(&data), 2);
        lease.release();
        assert!(lease.data().is_none());
        assert_eq!(Arc::strong_count(&data), 1);
    }
}
