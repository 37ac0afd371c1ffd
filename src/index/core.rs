//! The hash index proper: lookup, two-phase insert, CAS update, truncation.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::address::Address;

use super::bucket::{AtomicHashEntry, HashBucket, HashEntry, OverflowIndex};
use super::overflow::OverflowPool;
use super::table::BucketArray;
use super::{FindSlot, KeyHash};

/// Summary statistics over the live table.
#[derive(Debug, Clone)]
pub struct IndexStats {
    pub table_size: u64,
    pub total_slots: u64,
    pub used_entries: u64,
    pub overflow_buckets: u64,
    pub load_factor: f64,
}

/// The latch-free hash index.
///
/// Two table versions exist so growth can migrate between them; `version`
/// selects the live one. All entry mutation goes through 64-bit CAS.
pub struct HashIndex {
    pub(super) tables: [BucketArray; 2],
    pub(super) pools: [OverflowPool; 2],
    pub(super) version: AtomicU8,
    pub(super) growing: AtomicBool,
}

// SAFETY: buckets are atomics; arrays/pools are retired only behind epoch
// drains coordinated by the store.
unsafe impl Send for HashIndex {}
unsafe impl Sync for HashIndex {}

impl HashIndex {
    pub fn new(table_size: u64) -> Self {
        let mut index = Self {
            tables: [BucketArray::new(), BucketArray::new()],
            pools: [OverflowPool::new(), OverflowPool::new()],
            version: AtomicU8::new(0),
            growing: AtomicBool::new(false),
        };
        index.tables[0].initialize(table_size);
        index
    }

    #[inline]
    pub(super) fn live_version(&self) -> usize {
        self.version.load(Ordering::Acquire) as usize
    }

    /// Number of buckets in the live table.
    #[inline]
    pub fn size(&self) -> u64 {
        self.tables[self.live_version()].size()
    }

    /// Non-empty, non-tentative entries in the live table and its overflow
    /// chain.
    pub fn entry_count(&self) -> u64 {
        let version = self.live_version();
        let mut used = self.tables[version].count_entries();
        for ptr in self.pools[version].snapshot() {
            // SAFETY: pool pointers stay valid until clear(), which requires
            // exclusive access.
            let bucket = unsafe { &*ptr };
            for entry in &bucket.entries {
                let entry = entry.load(Ordering::Relaxed);
                if !entry.is_empty() && !entry.is_tentative() {
                    used += 1;
                }
            }
        }
        used
    }

    pub fn stats(&self) -> IndexStats {
        let version = self.live_version();
        let table_size = self.tables[version].size();
        let overflow_buckets = self.pools[version].len() as u64;
        let total_slots = (table_size + overflow_buckets) * HashBucket::ENTRIES as u64;
        let used_entries = self.entry_count();
        IndexStats {
            table_size,
            total_slots,
            used_entries,
            overflow_buckets,
            load_factor: used_entries as f64 / total_slots as f64,
        }
    }

    /// Find the non-tentative entry whose tag matches `hash`.
    ///
    /// During growth the new table is consulted first (it holds the latest
    /// heads); a miss falls back to the not-yet-migrated old table.
    pub fn find_entry(&self, hash: KeyHash) -> FindSlot {
        let version = self.live_version();
        let found = self.find_in_version(version, hash);
        if found.found() || !self.growing.load(Ordering::Acquire) {
            return found;
        }
        let old_version = 1 - version;
        if self.tables[old_version].is_initialized() {
            self.find_in_version(old_version, hash)
        } else {
            found
        }
    }

    pub(super) fn find_in_version(&self, version: usize, hash: KeyHash) -> FindSlot {
        if !self.tables[version].is_initialized() {
            return FindSlot::not_found();
        }
        let bucket = self.tables[version].bucket(hash);
        self.find_in_chain(version, bucket, hash.tag())
    }

    fn find_in_chain(&self, version: usize, base: &HashBucket, tag: u16) -> FindSlot {
        let mut bucket_ptr: *const HashBucket = base;
        loop {
            // SAFETY: bucket_ptr targets the live array or a pool bucket;
            // both outlive this lookup under epoch protection.
            let bucket = unsafe { &*bucket_ptr };
            for slot in &bucket.entries {
                let entry = slot.load(Ordering::Acquire);
                if !entry.is_empty() && !entry.is_tentative() && entry.tag() == tag {
                    return FindSlot {
                        entry,
                        slot: slot as *const AtomicHashEntry,
                    };
                }
            }
            let overflow = bucket.overflow.load(Ordering::Acquire);
            match self.pools[version].bucket_ptr(overflow) {
                Some(next) => bucket_ptr = next,
                None => return FindSlot::not_found(),
            }
        }
    }

    /// Find the entry for `hash`, creating an empty one if absent.
    ///
    /// Creation is the two-phase tentative protocol: claim an empty slot with
    /// the tentative bit set, rescan the chain for a competing claim of the
    /// same tag, back off and retry on conflict, otherwise clear the bit.
    pub fn find_or_create_entry(&self, hash: KeyHash) -> FindSlot {
        let version = self.live_version();

        loop {
            // During growth, a hit in either table is authoritative; entries
            // found only in the old table are migrated inline so the new
            // chain seeds from the old head.
            let found = self.find_in_version(version, hash);
            if found.found() {
                return found;
            }
            if self.growing.load(Ordering::Acquire) {
                let old_version = 1 - version;
                if self.tables[old_version].is_initialized() {
                    let old = self.find_in_version(old_version, hash);
                    if old.found() {
                        if let Some(migrated) = self.try_install(version, hash, old.entry.address())
                        {
                            return migrated;
                        }
                        continue;
                    }
                }
            }

            match self.try_install(version, hash, Address::INVALID) {
                Some(created) => return created,
                None => continue,
            }
        }
    }

    /// Try to claim a slot for `hash` in `version`, seeding it with
    /// `address`. Returns None when the claim raced and the caller should
    /// re-scan.
    fn try_install(&self, version: usize, hash: KeyHash, address: Address) -> Option<FindSlot> {
        let tag = hash.tag();
        let base = self.tables[version].bucket(hash);

        let slot = match self.free_slot_in_chain(version, base) {
            Some(slot) => slot,
            None => self.append_overflow_bucket(version, base)?,
        };

        // SAFETY: slot points into the live array or pool.
        let slot_ref = unsafe { &*slot };
        let tentative = HashEntry::new(address, tag, true);
        if slot_ref
            .compare_exchange(
                HashEntry::EMPTY,
                tentative,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return None;
        }

        // Phase two: if another thread claimed the same tag elsewhere in the
        // chain, exactly one of us must back off.
        if self.chain_has_conflict(version, base, tag, slot) {
            slot_ref.store(HashEntry::EMPTY, Ordering::Release);
            return None;
        }

        let committed = HashEntry::new(address, tag, false);
        slot_ref.store(committed, Ordering::Release);
        Some(FindSlot {
            entry: committed,
            slot,
        })
    }

    fn free_slot_in_chain(
        &self,
        version: usize,
        base: &HashBucket,
    ) -> Option<*const AtomicHashEntry> {
        let mut bucket_ptr: *const HashBucket = base;
        loop {
            // SAFETY: as in find_in_chain.
            let bucket = unsafe { &*bucket_ptr };
            for slot in &bucket.entries {
                if slot.load(Ordering::Acquire).is_empty() {
                    return Some(slot as *const AtomicHashEntry);
                }
            }
            let overflow = bucket.overflow.load(Ordering::Acquire);
            match self.pools[version].bucket_ptr(overflow) {
                Some(next) => bucket_ptr = next,
                None => return None,
            }
        }
    }

    /// Append a fresh overflow bucket to the chain tail and return its first
    /// slot. Loses gracefully if another thread appends first.
    fn append_overflow_bucket(
        &self,
        version: usize,
        base: &HashBucket,
    ) -> Option<*const AtomicHashEntry> {
        let mut bucket_ptr: *const HashBucket = base;
        loop {
            // SAFETY: as in find_in_chain.
            let bucket = unsafe { &*bucket_ptr };
            let overflow = bucket.overflow.load(Ordering::Acquire);
            if !overflow.is_none() {
                match self.pools[version].bucket_ptr(overflow) {
                    Some(next) => {
                        bucket_ptr = next;
                        continue;
                    }
                    None => return None,
                }
            }

            let (link, new_ptr) = self.pools[version].allocate();
            match bucket.overflow.compare_exchange(
                OverflowIndex::NONE,
                link,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // SAFETY: freshly allocated bucket.
                    let new_bucket = unsafe { &*new_ptr };
                    return Some(&new_bucket.entries[0] as *const AtomicHashEntry);
                }
                Err(actual) => {
                    self.pools[version].deallocate(link);
                    match self.pools[version].bucket_ptr(actual) {
                        Some(next) => bucket_ptr = next,
                        None => return None,
                    }
                }
            }
        }
    }

    fn chain_has_conflict(
        &self,
        version: usize,
        base: &HashBucket,
        tag: u16,
        ours: *const AtomicHashEntry,
    ) -> bool {
        let mut bucket_ptr: *const HashBucket = base;
        loop {
            // SAFETY: as in find_in_chain.
            let bucket = unsafe { &*bucket_ptr };
            for slot in &bucket.entries {
                let slot_ptr = slot as *const AtomicHashEntry;
                if slot_ptr == ours {
                    continue;
                }
                let entry = slot.load(Ordering::Acquire);
                if !entry.is_empty() && entry.tag() == tag {
                    // A committed duplicate always wins; between two
                    // tentatives, the later slot address backs off so exactly
                    // one survives.
                    if !entry.is_tentative() || slot_ptr < ours {
                        return true;
                    }
                }
            }
            let overflow = bucket.overflow.load(Ordering::Acquire);
            match self.pools[version].bucket_ptr(overflow) {
                Some(next) => bucket_ptr = next,
                None => return false,
            }
        }
    }

    /// CAS `slot` from the snapshot in `find` to a new chain head.
    pub fn try_update_entry(&self, find: &FindSlot, new_address: Address, tag: u16) -> bool {
        // SAFETY: caller holds epoch protection from the lookup.
        let slot = unsafe { find.slot_ref() };
        let new_entry = HashEntry::new(new_address, tag, false);
        slot.compare_exchange(find.entry, new_entry, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// CAS `slot` back to `new_address` (or empty when invalid) — used by
    /// delete unlinking and read-cache eviction. Best effort.
    pub fn try_unlink_entry(&self, find: &FindSlot, new_address: Address, tag: u16) -> bool {
        // SAFETY: caller holds epoch protection from the lookup.
        let slot = unsafe { find.slot_ref() };
        let new_entry = if new_address.is_invalid() {
            HashEntry::EMPTY
        } else {
            HashEntry::new(new_address, tag, false)
        };
        slot.compare_exchange(find.entry, new_entry, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Drop entries whose addresses fell below the new begin address (log
    /// truncation). Returns how many entries were cleared.
    pub fn truncate_below(&self, begin: Address) -> u64 {
        let version = self.live_version();
        let mut cleared = 0;
        self.for_each_slot(version, |slot| {
            let entry = slot.load(Ordering::Acquire);
            if entry.is_empty() || entry.is_tentative() || entry.in_read_cache() {
                return;
            }
            if entry.address() < begin
                && slot
                    .compare_exchange(entry, HashEntry::EMPTY, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                cleared += 1;
            }
        });
        cleared
    }

    /// Clear any tentative leftovers (used after recovery).
    pub fn clear_tentative(&self) {
        let version = self.live_version();
        self.for_each_slot(version, |slot| {
            if slot.load(Ordering::Acquire).is_tentative() {
                slot.store(HashEntry::EMPTY, Ordering::Release);
            }
        });
    }

    pub(super) fn for_each_slot<F: FnMut(&AtomicHashEntry)>(&self, version: usize, mut f: F) {
        for index in 0..self.tables[version].size() {
            let mut bucket_ptr: *const HashBucket = self.tables[version].bucket_at(index);
            loop {
                // SAFETY: as in find_in_chain.
                let bucket = unsafe { &*bucket_ptr };
                for slot in &bucket.entries {
                    f(slot);
                }
                let overflow = bucket.overflow.load(Ordering::Acquire);
                match self.pools[version].bucket_ptr(overflow) {
                    Some(next) => bucket_ptr = next,
                    None => break,
                }
            }
        }
    }
}
