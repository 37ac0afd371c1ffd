//! Flat, cache-line-aligned array of hash buckets.

use std::sync::atomic::Ordering;

use crate::epoch::CACHE_LINE_BYTES;
use crate::utility::{is_power_of_two, AlignedBuffer};

use super::bucket::HashBucket;
use super::KeyHash;

/// One version of the bucket array. Two of these live in the index so growth
/// can migrate between them.
pub(crate) struct BucketArray {
    buffer: Option<AlignedBuffer>,
    size: u64,
}

impl BucketArray {
    pub const fn new() -> Self {
        Self {
            buffer: None,
            size: 0,
        }
    }

    /// (Re)initialise to `size` zeroed buckets.
    pub fn initialize(&mut self, size: u64) {
        assert!(is_power_of_two(size), "bucket count must be a power of two");
        assert!(size < i32::MAX as u64, "bucket count too large");

        let bytes = (size as usize) * std::mem::size_of::<HashBucket>();
        match &self.buffer {
            Some(buffer) if self.size == size => buffer.clear(),
            _ => {
                self.buffer = AlignedBuffer::zeroed(CACHE_LINE_BYTES, bytes);
                assert!(self.buffer.is_some(), "bucket array allocation failed");
                self.size = size;
            }
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.buffer.is_some()
    }

    #[inline]
    pub fn bucket(&self, hash: KeyHash) -> &HashBucket {
        self.bucket_at(hash.bucket_index(self.size))
    }

    #[inline]
    pub fn bucket_at(&self, index: u64) -> &HashBucket {
        debug_assert!(index < self.size);
        let buffer = self.buffer.as_ref().expect("bucket array initialized");
        // SAFETY: the buffer holds `size` buckets; zeroed memory is a valid
        // all-empty HashBucket (every field is a plain atomic word).
        unsafe { &*(buffer.as_ptr() as *const HashBucket).add(index as usize) }
    }

    /// Number of non-empty, non-tentative entries across all main buckets.
    pub fn count_entries(&self) -> u64 {
        let mut used = 0;
        for index in 0..self.size {
            let bucket = self.bucket_at(index);
            for entry in &bucket.entries {
                let entry = entry.load(Ordering::Relaxed);
                if !entry.is_empty() && !entry.is_tentative() {
                    used += 1;
                }
            }
        }
        used
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::index::bucket::HashEntry;

    #[test]
    fn initialize_and_access() {
        let mut array = BucketArray::new();
        array.initialize(64);
        assert!(array.is_initialized());
        assert_eq!(array.size(), 64);
        assert!(array.bucket_at(63).entries[6].load(Ordering::Relaxed).is_empty());
    }

    #[test]
    fn reinitialize_same_size_clears() {
        let mut array = BucketArray::new();
        array.initialize(16);
        array.bucket_at(3).entries[0].store(
            HashEntry::new(Address::new(64), 9, false),
            Ordering::Release,
        );
        assert_eq!(array.count_entries(), 1);
        array.initialize(16);
        assert_eq!(array.count_entries(), 0);
    }

    #[test]
    #[should_panic]
    fn rejects_non_power_of_two() {
        let mut array = BucketArray::new();
        array.initialize(100);
    }
}
