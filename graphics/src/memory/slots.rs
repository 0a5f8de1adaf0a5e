//! Free-list sub-allocator for a single fixed-size arena.
//!
//! [`MemorySlots`] tracks which byte ranges of an arena (one buffer or one
//! device memory block) are free and which are reserved. It knows nothing
//! about GPU handles; pools wrap one per arena.
//!
//! # Placement
//!
//! ```text
//! free ranges, ordered by (size, offset):
//!   (64, 960)  (128, 0)  (128, 512)  (256, 640)
//!                  ^
//!   reserve(100, 16) picks the first range large enough once aligned:
//!   the smallest fitting size, lowest offset among equal sizes.
//!
//! before: |  free 128  | ...
//! after:  | res 100 |28| ...          tail 28 stays free
//! ```
//!
//! When the chosen range starts on an unaligned offset the bytes up to the
//! aligned start remain a free range of their own, so every byte of the
//! arena is always either free or reserved.
//!
//! # Release
//!
//! Releasing a range merges it with a free predecessor ending at its start
//! and a free successor starting at its end, so free ranges never touch.

use std::collections::{BTreeMap, BTreeSet};

/// Round `value` up to a multiple of `alignment`. An alignment of 0 is treated as 1.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    value.next_multiple_of(alignment.max(1))
}

/// Free/reserved bookkeeping for one arena.
#[derive(Debug, Clone)]
pub struct MemorySlots {
    total_memory_size: u64,
    total_reserved_size: u64,
    /// Free ranges keyed by `(size, offset)` for best-fit lookup.
    available_memory: BTreeSet<(u64, u64)>,
    /// Free ranges keyed by offset for coalescing.
    offset_sizes: BTreeMap<u64, u64>,
    /// Reserved ranges keyed by offset.
    reserved_memory: BTreeMap<u64, u64>,
}

impl MemorySlots {
    /// Create bookkeeping for an arena of `total_memory_size` bytes, all free.
    pub fn new(total_memory_size: u64) -> Self {
        let mut slots = Self {
            total_memory_size,
            total_reserved_size: 0,
            available_memory: BTreeSet::new(),
            offset_sizes: BTreeMap::new(),
            reserved_memory: BTreeMap::new(),
        };
        if total_memory_size > 0 {
            slots.insert_available(0, total_memory_size);
        }
        slots
    }

    /// Reserve `size` bytes starting at a multiple of `alignment`.
    ///
    /// Picks the smallest free range that can hold the aligned request; among
    /// equally sized ranges the one with the lowest offset wins, so placement
    /// is deterministic for a given history of calls.
    ///
    /// Returns `None` when no free range fits. That is the signal for the
    /// owning pool to grow, not an error.
    pub fn reserve(&mut self, size: u64, alignment: u64) -> Option<u64> {
        if size == 0 || size > self.maximum_available_space() {
            return None;
        }

        let (block_offset, block_size, aligned_offset) = self
            .available_memory
            .range((size, 0)..)
            .find_map(|&(block_size, block_offset)| {
                let aligned_offset = align_up(block_offset, alignment);
                let padding = aligned_offset - block_offset;
                let needed = padding.checked_add(size)?;
                (needed <= block_size).then_some((block_offset, block_size, aligned_offset))
            })?;

        self.remove_available(block_offset, block_size);

        if aligned_offset > block_offset {
            self.insert_available(block_offset, aligned_offset - block_offset);
        }

        let reserved_end = aligned_offset + size;
        let block_end = block_offset + block_size;
        if reserved_end < block_end {
            self.insert_available(reserved_end, block_end - reserved_end);
        }

        self.reserved_memory.insert(aligned_offset, size);
        self.total_reserved_size += size;

        Some(aligned_offset)
    }

    /// Return a reserved range and merge it with its free neighbours.
    ///
    /// Releasing an offset that is not reserved is a caller bug: it is logged
    /// and ignored, and `false` is returned. If `size` disagrees with the
    /// recorded reservation the recorded size is used.
    pub fn release(&mut self, offset: u64, size: u64) -> bool {
        let Some(reserved_size) = self.reserved_memory.remove(&offset) else {
            log::warn!(
                "MemorySlots::release({offset}, {size}): no reservation at this offset, ignored"
            );
            return false;
        };

        if reserved_size != size {
            log::warn!(
                "MemorySlots::release({offset}, {size}): reservation is {reserved_size} bytes, releasing that"
            );
        }

        self.total_reserved_size -= reserved_size;

        let mut start = offset;
        let mut end = offset + reserved_size;

        let predecessor = self
            .offset_sizes
            .range(..offset)
            .next_back()
            .map(|(&o, &s)| (o, s));
        if let Some((prev_offset, prev_size)) = predecessor
            && prev_offset + prev_size == offset
        {
            self.remove_available(prev_offset, prev_size);
            start = prev_offset;
        }

        if let Some(&next_size) = self.offset_sizes.get(&end) {
            self.remove_available(end, next_size);
            end += next_size;
        }

        self.insert_available(start, end - start);
        true
    }

    /// Whether no free bytes remain.
    pub fn full(&self) -> bool {
        self.available_memory.is_empty()
    }

    /// Size of the largest free range.
    pub fn maximum_available_space(&self) -> u64 {
        self.available_memory
            .last()
            .map(|&(size, _)| size)
            .unwrap_or(0)
    }

    /// Sum of all free ranges.
    pub fn total_available_size(&self) -> u64 {
        self.total_memory_size - self.total_reserved_size
    }

    /// Sum of all reserved ranges.
    pub fn total_reserved_size(&self) -> u64 {
        self.total_reserved_size
    }

    /// Arena size.
    pub fn total_memory_size(&self) -> u64 {
        self.total_memory_size
    }

    /// Size of the reservation starting at `offset`, if any.
    pub fn reserved_size(&self, offset: u64) -> Option<u64> {
        self.reserved_memory.get(&offset).copied()
    }

    /// Number of reserved ranges.
    pub fn reservation_count(&self) -> usize {
        self.reserved_memory.len()
    }

    /// Number of free ranges.
    pub fn free_range_count(&self) -> usize {
        self.offset_sizes.len()
    }

    /// Validate internal consistency.
    ///
    /// Checks that both free-range indices agree, that free and reserved
    /// ranges tile the arena without gaps or overlap, that no two free ranges
    /// touch, and that the cached totals match.
    pub fn check(&self) -> Result<(), String> {
        if self.available_memory.len() != self.offset_sizes.len() {
            return Err(format!(
                "free index mismatch: {} by size, {} by offset",
                self.available_memory.len(),
                self.offset_sizes.len()
            ));
        }
        for (&offset, &size) in &self.offset_sizes {
            if !self.available_memory.contains(&(size, offset)) {
                return Err(format!("free range ({offset}, {size}) missing from size index"));
            }
        }

        let reserved_sum: u64 = self.reserved_memory.values().sum();
        if reserved_sum != self.total_reserved_size {
            return Err(format!(
                "reserved total {} does not match sum {reserved_sum}",
                self.total_reserved_size
            ));
        }
        let free_sum: u64 = self.offset_sizes.values().sum();
        if free_sum + reserved_sum != self.total_memory_size {
            return Err(format!(
                "free {free_sum} + reserved {reserved_sum} != total {}",
                self.total_memory_size
            ));
        }

        let mut ranges: Vec<(u64, u64, bool)> = self
            .offset_sizes
            .iter()
            .map(|(&o, &s)| (o, s, true))
            .chain(self.reserved_memory.iter().map(|(&o, &s)| (o, s, false)))
            .collect();
        ranges.sort_unstable_by_key(|&(offset, _, _)| offset);

        let mut cursor = 0u64;
        let mut previous_free = false;
        for (offset, size, free) in ranges {
            if size == 0 {
                return Err(format!("zero-sized range at {offset}"));
            }
            if offset != cursor {
                return Err(format!("expected range at {cursor}, found one at {offset}"));
            }
            if free && previous_free {
                return Err(format!("free range at {offset} not merged with its predecessor"));
            }
            previous_free = free;
            cursor = offset + size;
        }
        if cursor != self.total_memory_size {
            return Err(format!(
                "ranges end at {cursor}, arena is {} bytes",
                self.total_memory_size
            ));
        }

        Ok(())
    }

    /// Log the slot layout at debug level.
    pub fn report(&self) {
        log::debug!(
            "MemorySlots: total {} reserved {} available {} largest free {}",
            self.total_memory_size,
            self.total_reserved_size,
            self.total_available_size(),
            self.maximum_available_space()
        );
        for (offset, size) in &self.offset_sizes {
            log::debug!("  free     [{offset}, {})", offset + size);
        }
        for (offset, size) in &self.reserved_memory {
            log::debug!("  reserved [{offset}, {})", offset + size);
        }
    }

    fn insert_available(&mut self, offset: u64, size: u64) {
        self.available_memory.insert((size, offset));
        self.offset_sizes.insert(offset, size);
    }

    fn remove_available(&mut self, offset: u64, size: u64) {
        self.available_memory.remove(&(size, offset));
        self.offset_sizes.remove(&offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_consistent(slots: &MemorySlots) {
        if let Err(msg) = slots.check() {
            panic!("inconsistent slots: {msg}");
        }
    }

    #[test]
    fn test_new_arena_is_one_free_range() {
        let slots = MemorySlots::new(1024);
        assert!(!slots.full());
        assert_eq!(slots.maximum_available_space(), 1024);
        assert_eq!(slots.total_available_size(), 1024);
        assert_eq!(slots.total_reserved_size(), 0);
        assert_eq!(slots.total_memory_size(), 1024);
        assert_consistent(&slots);
    }

    #[test]
    fn test_empty_arena_is_full() {
        let mut slots = MemorySlots::new(0);
        assert!(slots.full());
        assert_eq!(slots.reserve(1, 1), None);
        assert_consistent(&slots);
    }

    #[test]
    fn test_reserve_release_reserve_reuses_offset() {
        let mut slots = MemorySlots::new(1024);

        assert_eq!(slots.reserve(300, 16), Some(0));
        assert_eq!(slots.reserve(300, 16), Some(304));
        assert_consistent(&slots);

        assert!(slots.release(0, 300));
        assert_consistent(&slots);

        assert_eq!(slots.reserve(300, 16), Some(0));
        assert_consistent(&slots);
    }

    #[test]
    fn test_padding_stays_free() {
        let mut slots = MemorySlots::new(1024);
        slots.reserve(300, 16);
        slots.reserve(300, 16);
        // [300, 304) is the alignment padding in front of the second reservation.
        assert_eq!(slots.total_reserved_size(), 600);
        assert_eq!(slots.total_available_size(), 424);
        assert_eq!(slots.free_range_count(), 2);
        assert_consistent(&slots);
    }

    #[test]
    fn test_adjacent_releases_coalesce() {
        let mut slots = MemorySlots::new(200);
        let a = slots.reserve(100, 1).unwrap();
        let b = slots.reserve(100, 1).unwrap();
        assert!(slots.full());

        slots.release(a, 100);
        slots.release(b, 100);
        assert_consistent(&slots);
        assert_eq!(slots.free_range_count(), 1);
        assert_eq!(slots.reserve(200, 1), Some(0));
    }

    #[test]
    fn test_release_merges_both_neighbours() {
        let mut slots = MemorySlots::new(300);
        let a = slots.reserve(100, 1).unwrap();
        let b = slots.reserve(100, 1).unwrap();
        let c = slots.reserve(100, 1).unwrap();

        slots.release(a, 100);
        slots.release(c, 100);
        assert_eq!(slots.free_range_count(), 2);

        slots.release(b, 100);
        assert_eq!(slots.free_range_count(), 1);
        assert_eq!(slots.maximum_available_space(), 300);
        assert_consistent(&slots);
    }

    #[test]
    fn test_best_fit_prefers_smallest_range() {
        let mut slots = MemorySlots::new(1000);
        let a = slots.reserve(400, 1).unwrap();
        let _b = slots.reserve(100, 1).unwrap();
        let c = slots.reserve(50, 1).unwrap();
        let _d = slots.reserve(100, 1).unwrap();
        // free: [0,400) via release, [500,550) via release, [650,1000) tail
        slots.release(a, 400);
        slots.release(c, 50);

        assert_eq!(slots.reserve(40, 1), Some(500));
        assert_eq!(slots.reserve(300, 1), Some(650));
        assert_eq!(slots.reserve(390, 1), Some(0));
        assert_consistent(&slots);
    }

    #[test]
    fn test_equal_sizes_pick_lowest_offset() {
        let mut slots = MemorySlots::new(500);
        let offsets: Vec<u64> = (0..5).map(|_| slots.reserve(100, 1).unwrap()).collect();
        slots.release(offsets[3], 100);
        slots.release(offsets[1], 100);

        assert_eq!(slots.reserve(100, 1), Some(100));
        assert_eq!(slots.reserve(100, 1), Some(300));
    }

    #[test]
    fn test_alignment_respected() {
        let mut slots = MemorySlots::new(4096);
        slots.reserve(3, 1);
        for alignment in [4u64, 16, 64, 256] {
            let offset = slots.reserve(10, alignment).unwrap();
            assert_eq!(offset % alignment, 0);
        }
        assert_consistent(&slots);
    }

    #[test]
    fn test_non_power_of_two_alignment() {
        let mut slots = MemorySlots::new(100);
        slots.reserve(5, 1);
        assert_eq!(slots.reserve(12, 12), Some(12));
        assert_consistent(&slots);
    }

    #[test]
    fn test_alignment_can_exclude_range() {
        let mut slots = MemorySlots::new(64);
        slots.reserve(1, 1);
        // 63 bytes free from offset 1, but only 32 of them are 32-aligned.
        assert_eq!(slots.reserve(40, 32), None);
        assert_eq!(slots.reserve(32, 32), Some(32));
        assert_consistent(&slots);
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let mut slots = MemorySlots::new(128);
        assert_eq!(slots.reserve(129, 1), None);
        assert_eq!(slots.reserve(128, 1), Some(0));
        assert!(slots.full());
        assert_eq!(slots.reserve(1, 1), None);
    }

    #[test]
    fn test_zero_size_rejected() {
        let mut slots = MemorySlots::new(128);
        assert_eq!(slots.reserve(0, 16), None);
        assert_eq!(slots.total_reserved_size(), 0);
    }

    #[test]
    fn test_unknown_release_ignored() {
        let mut slots = MemorySlots::new(128);
        slots.reserve(64, 1);
        assert!(!slots.release(32, 16));
        assert!(!slots.release(64, 64));
        assert_eq!(slots.total_reserved_size(), 64);
        assert_consistent(&slots);
    }

    #[test]
    fn test_double_release_ignored() {
        let mut slots = MemorySlots::new(128);
        let offset = slots.reserve(64, 1).unwrap();
        assert!(slots.release(offset, 64));
        assert!(!slots.release(offset, 64));
        assert_eq!(slots.total_available_size(), 128);
        assert_consistent(&slots);
    }

    #[test]
    fn test_release_size_mismatch_uses_recorded_size() {
        let mut slots = MemorySlots::new(128);
        let offset = slots.reserve(64, 1).unwrap();
        assert!(slots.release(offset, 10));
        assert_eq!(slots.total_reserved_size(), 0);
        assert_consistent(&slots);
    }

    #[test]
    fn test_reserved_size_lookup() {
        let mut slots = MemorySlots::new(128);
        let offset = slots.reserve(24, 8).unwrap();
        assert_eq!(slots.reserved_size(offset), Some(24));
        assert_eq!(slots.reserved_size(offset + 1), None);
        assert_eq!(slots.reservation_count(), 1);
    }

    #[test]
    fn test_mixed_workload_keeps_invariants() {
        // Deterministic pseudo-random sequence (xorshift).
        let mut state = 0x2545_f491_4f6c_dd1du64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut slots = MemorySlots::new(64 * 1024);
        let mut live: Vec<(u64, u64)> = Vec::new();

        for _ in 0..2000 {
            if live.is_empty() || next() % 3 != 0 {
                let size = 1 + next() % 2048;
                let alignment = 1u64 << (next() % 8);
                if let Some(offset) = slots.reserve(size, alignment) {
                    assert_eq!(offset % alignment, 0);
                    assert!(offset + size <= slots.total_memory_size());
                    for &(o, s) in &live {
                        assert!(offset + size <= o || o + s <= offset, "overlap");
                    }
                    live.push((offset, size));
                }
            } else {
                let index = (next() % live.len() as u64) as usize;
                let (offset, size) = live.swap_remove(index);
                assert!(slots.release(offset, size));
            }
            assert_consistent(&slots);
        }

        for (offset, size) in live.drain(..) {
            slots.release(offset, size);
        }
        assert_eq!(slots.free_range_count(), 1);
        assert_eq!(slots.total_available_size(), 64 * 1024);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(300, 16), 304);
        assert_eq!(align_up(7, 0), 7);
        assert_eq!(align_up(13, 12), 24);
    }
}
