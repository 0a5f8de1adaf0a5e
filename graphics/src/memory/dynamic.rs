//! CPU-side data that is re-uploaded whenever it changes.

use std::sync::atomic::{AtomicU64, Ordering};

use bytemuck::Pod;
use parking_lot::RwLock;

/// Bytes owned by the CPU plus a modification counter.
///
/// A [`TransferTask`](crate::pipeline::TransferTask) compares the counter
/// against the value it last uploaded and copies the bytes to the GPU only
/// when they differ. Every mutating method bumps the counter.
#[derive(Debug, Default)]
pub struct DynamicData {
    bytes: RwLock<Vec<u8>>,
    modified_count: AtomicU64,
}

impl DynamicData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: RwLock::new(bytes),
            modified_count: AtomicU64::new(0),
        }
    }

    /// Zero-filled data of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }

    /// Data initialized from a plain-old-data value.
    pub fn from_pod<T: Pod>(value: &T) -> Self {
        Self::new(bytemuck::bytes_of(value).to_vec())
    }

    pub fn len(&self) -> usize {
        self.bytes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the contents.
    pub fn set(&self, bytes: &[u8]) {
        {
            let mut data = self.bytes.write();
            data.clear();
            data.extend_from_slice(bytes);
        }
        self.dirty();
    }

    /// Overwrite the leading bytes with a plain-old-data value.
    ///
    /// Grows the data if the value is longer than the current contents.
    pub fn write<T: Pod>(&self, value: &T) {
        let src = bytemuck::bytes_of(value);
        {
            let mut data = self.bytes.write();
            if data.len() < src.len() {
                data.resize(src.len(), 0);
            }
            data[..src.len()].copy_from_slice(src);
        }
        self.dirty();
    }

    /// Edit the bytes in place.
    pub fn update(&self, f: impl FnOnce(&mut [u8])) {
        f(&mut self.bytes.write());
        self.dirty();
    }

    /// Mark the data modified without changing it.
    pub fn dirty(&self) {
        self.modified_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of modifications so far.
    pub fn modified_count(&self) -> u64 {
        self.modified_count.load(Ordering::Acquire)
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }

    /// Run `f` with a read view of the bytes.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.bytes.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutations_bump_counter() {
        let data = DynamicData::zeroed(8);
        assert_eq!(data.modified_count(), 0);

        data.set(&[1, 2, 3]);
        assert_eq!(data.modified_count(), 1);
        assert_eq!(data.snapshot(), vec![1, 2, 3]);

        data.update(|bytes| bytes[0] = 9);
        assert_eq!(data.modified_count(), 2);

        data.dirty();
        assert_eq!(data.modified_count(), 3);
    }

    #[test]
    fn test_write_pod() {
        let data = DynamicData::zeroed(2);
        data.write(&[1.0f32, 2.0f32]);
        assert_eq!(data.len(), 8);
        assert_eq!(
            data.with_bytes(|b| bytemuck::pod_read_unaligned::<[f32; 2]>(b)),
            [1.0, 2.0]
        );
    }
}
