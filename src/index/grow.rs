//! Index growth: double into the secondary table, rehashing chunkwise.
//!
//! While `growing` is set, lookups consult both tables and writers install
//! into the new one (`find_or_create_entry` migrates old-table hits inline).
//! The sweep below walks the old table in chunks so the driver can interleave
//! epoch refreshes; entries whose tag already landed in the new table are
//! skipped because the inline migration got there first.

use std::sync::atomic::Ordering;

use crate::address::Address;
use crate::status::Status;

use super::bucket::{HashBucket, HashEntry};
use super::core::HashIndex;
use super::KeyHash;

/// Buckets migrated per chunk between driver refreshes.
pub(crate) const GROW_CHUNK_BUCKETS: u64 = 4096;

/// Result of a completed growth.
#[derive(Debug, Clone)]
pub struct GrowOutcome {
    pub old_size: u64,
    pub new_size: u64,
    pub entries_migrated: u64,
}

impl HashIndex {
    /// Begin growing to `new_size` buckets. Fails if a growth is already in
    /// flight or the size does not actually grow the table.
    pub(crate) fn start_grow(&mut self, new_size: u64) -> Result<(), Status> {
        if self.growing.swap(true, Ordering::AcqRel) {
            return Err(Status::Aborted);
        }
        let live = self.live_version();
        let old_size = self.tables[live].size();
        if new_size <= old_size || !new_size.is_power_of_two() {
            self.growing.store(false, Ordering::Release);
            return Err(Status::InvalidArgument);
        }

        let next = 1 - live;
        self.tables[next].initialize(new_size);
        self.pools[next].clear();
        // Writers begin installing into the new table the moment `growing`
        // is visible together with the flipped version.
        self.version.store(next as u8, Ordering::Release);
        Ok(())
    }

    /// Number of chunks the migration sweep needs.
    pub(crate) fn grow_chunks(&self) -> u64 {
        let old = 1 - self.live_version();
        self.tables[old].size().div_ceil(GROW_CHUNK_BUCKETS)
    }

    /// Migrate one chunk of old-table buckets into the live table.
    ///
    /// `rehash` maps a chain-head address back to its key hash (the store
    /// reads the record's key from the log); `None` drops the entry, which
    /// only happens for addresses that fell below the begin address.
    pub(crate) fn migrate_chunk<F>(&self, chunk: u64, rehash: &F) -> u64
    where
        F: Fn(Address) -> Option<KeyHash>,
    {
        let live = self.live_version();
        let old = 1 - live;
        let old_size = self.tables[old].size();
        let start = chunk * GROW_CHUNK_BUCKETS;
        let end = (start + GROW_CHUNK_BUCKETS).min(old_size);
        let mut migrated = 0;

        for bucket_index in start..end {
            let mut bucket_ptr: *const HashBucket = self.tables[old].bucket_at(bucket_index);
            loop {
                // SAFETY: the old table stays allocated until the growth
                // epoch drain completes.
                let bucket = unsafe { &*bucket_ptr };
                for slot in &bucket.entries {
                    let entry = slot.load(Ordering::Acquire);
                    if entry.is_empty() || entry.is_tentative() {
                        continue;
                    }
                    let Some(hash) = rehash(entry.address()) else {
                        continue;
                    };
                    if self.install_migrated(live, hash, entry) {
                        migrated += 1;
                    }
                }
                let overflow = bucket.overflow.load(Ordering::Acquire);
                match self.pools[old].bucket_ptr(overflow) {
                    Some(next) => bucket_ptr = next,
                    None => break,
                }
            }
        }
        migrated
    }

    /// Install an old-table entry into the live table unless its tag is
    /// already present (a concurrent writer or the inline migration beat us).
    fn install_migrated(&self, live: usize, hash: KeyHash, entry: HashEntry) -> bool {
        if self.find_in_version(live, hash).found() {
            return false;
        }
        let slot = self.find_or_create_entry(hash);
        if !slot.entry.address().is_invalid() {
            // Chain already seeded by a concurrent operation.
            return false;
        }
        self.try_update_entry(&slot, entry.address(), hash.tag())
    }

    /// Finish the growth: stop consulting the old table.
    ///
    /// The caller gates this on an epoch drain so no thread still walks the
    /// old table when it is eventually re-initialised by the next growth.
    pub(crate) fn finish_grow(&self) -> GrowOutcome {
        let live = self.live_version();
        let old = 1 - live;
        let outcome = GrowOutcome {
            old_size: self.tables[old].size(),
            new_size: self.tables[live].size(),
            entries_migrated: self.tables[live].count_entries(),
        };
        self.growing.store(false, Ordering::Release);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn grow_migrates_all_entries() {
        let mut index = HashIndex::new(16);
        let mut addresses: HashMap<u64, KeyHash> = HashMap::new();
        for i in 0..100u64 {
            // Distinct tags and spread buckets, no accidental collisions.
            let hash = KeyHash::new(((i + 1) << 48) | i);
            let slot = index.find_or_create_entry(hash);
            let addr = Address::new(64 + i * 64);
            assert!(index.try_update_entry(&slot, addr, hash.tag()));
            addresses.insert(addr.control(), hash);
        }
        let before = index.entry_count();

        index.start_grow(64).unwrap();
        let rehash = |addr: Address| addresses.get(&addr.control()).copied();
        for chunk in 0..index.grow_chunks() {
            index.migrate_chunk(chunk, &rehash);
        }
        let outcome = index.finish_grow();

        assert_eq!(outcome.new_size, 64);
        assert_eq!(index.size(), 64);
        assert_eq!(index.entry_count(), before);
        for hash in addresses.values() {
            assert!(index.find_entry(*hash).found());
        }
    }

    #[test]
    fn start_grow_rejects_shrink() {
        let mut index = HashIndex::new(64);
        assert!(matches!(index.start_grow(32), Err(Status::InvalidArgument)));
        assert!(matches!(index.start_grow(64), Err(Status::InvalidArgument)));
        // Failed starts leave the index usable.
        assert!(index.start_grow(128).is_ok());
    }
}
