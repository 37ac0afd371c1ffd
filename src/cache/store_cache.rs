//! The read cache allocator and its hash-chain maintenance.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::address::{Address, AtomicAddress, AtomicTailOffset, TailOffset};
use crate::codec::{KeyCodec, StoreKey, StoreValue, ValueCodec};
use crate::epoch::EpochManager;
use crate::hlog::FIRST_LOG_ADDRESS;
use crate::index::{HashIndex, KeyHash};
use crate::record::{
    self, parse_record, write_record, ParsedRecord, RecordHeader, RecordLayout,
};
use crate::utility::AlignedBuffer;

use super::ReadCacheConfig;

/// Hit/miss/insert/eviction counters.
#[derive(Debug, Default)]
pub struct ReadCacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evicted_records: AtomicU64,
}

impl ReadCacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn inserts(&self) -> u64 {
        self.inserts.load(Ordering::Relaxed)
    }

    pub fn evicted_records(&self) -> u64 {
        self.evicted_records.load(Ordering::Relaxed)
    }
}

/// Outcome of probing the cache during a read.
pub struct CacheHit<V> {
    /// The cached value, if the record matched and was live.
    pub value: Option<V>,
    /// Main-log address the cache record shadows; chain traversal continues
    /// there on a miss.
    pub underlying: Address,
    /// The hit landed below the refresh boundary; the caller should
    /// re-insert the value at the cache tail.
    pub refresh: bool,
}

struct CacheSlot {
    buffer: AlignedBuffer,
    /// Cache page number + 1; zero = empty.
    owner: AtomicU64,
}

impl CacheSlot {
    #[inline]
    fn holds(&self, page: u64) -> bool {
        self.owner.load(Ordering::Acquire) == page + 1
    }
}

/// The read cache. Addresses handed out carry `Address::READ_CACHE_BIT`.
pub struct ReadCache<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    config: ReadCacheConfig,
    epoch: Arc<EpochManager>,
    slots: Box<[CacheSlot]>,
    tail: AtomicTailOffset,
    /// Published eviction boundary (cache-internal address, no marker bit).
    head: AtomicAddress,
    /// Confirmed (drained) eviction boundary; slots recycle behind it.
    /// Shared so the drain action can outlive `&self`.
    safe_head: Arc<AtomicAddress>,
    stats: ReadCacheStats,
    _marker: PhantomData<(K, V)>,
}

// SAFETY: slot buffers are recycled only behind epoch drains; everything
// else is atomic.
unsafe impl<K: StoreKey, V: StoreValue> Send for ReadCache<K, V> {}
unsafe impl<K: StoreKey, V: StoreValue> Sync for ReadCache<K, V> {}

impl<K, V> ReadCache<K, V>
where
    K: StoreKey,
    V: StoreValue,
{
    pub fn new(config: ReadCacheConfig, epoch: Arc<EpochManager>) -> Self {
        let page_size = config.page_size() as usize;
        let pages = config.pages();
        assert!(pages >= 2, "read cache must hold at least 2 pages");

        let slots: Box<[CacheSlot]> = (0..pages)
            .map(|_| CacheSlot {
                buffer: AlignedBuffer::zeroed(64, page_size).expect("cache page"),
                owner: AtomicU64::new(0),
            })
            .collect();
        slots[0].owner.store(1, Ordering::Release);

        Self {
            config,
            epoch,
            slots,
            tail: AtomicTailOffset::new(TailOffset::new(0, FIRST_LOG_ADDRESS)),
            head: AtomicAddress::new(Address::new(FIRST_LOG_ADDRESS)),
            safe_head: Arc::new(AtomicAddress::new(Address::new(FIRST_LOG_ADDRESS))),
            stats: ReadCacheStats::default(),
            _marker: PhantomData,
        }
    }

    pub fn stats(&self) -> &ReadCacheStats {
        &self.stats
    }

    #[inline]
    fn slot(&self, page: u64) -> &CacheSlot {
        &self.slots[(page % self.slots.len() as u64) as usize]
    }

    #[inline]
    fn page_of(&self, address: Address) -> u64 {
        address.page(self.config.page_bits)
    }

    #[inline]
    fn page_start(&self, page: u64) -> Address {
        Address::from_page(page, self.config.page_bits)
    }

    fn tail_address(&self) -> Address {
        self.tail
            .load(Ordering::Acquire)
            .to_address(self.config.page_bits)
    }

    /// Addresses below this boundary get a second chance on hit.
    fn refresh_boundary(&self) -> Address {
        let tail_page = self.tail.load(Ordering::Acquire).page();
        let fresh = self.config.fresh_pages();
        if tail_page >= fresh {
            self.page_start(tail_page - fresh + 1)
        } else {
            Address::new(0)
        }
    }

    /// Probe the cache at `entry_address` (marker bit set) for `key`.
    ///
    /// Must be called under epoch protection.
    pub fn probe(&self, entry_address: Address, key: &K) -> CacheHit<V> {
        debug_assert!(entry_address.in_read_cache());
        let address = entry_address.without_read_cache_bit();

        let miss = |underlying| {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            CacheHit {
                value: None,
                underlying,
                refresh: false,
            }
        };

        if address < self.safe_head.load(Ordering::Acquire) {
            // Evicted (or being evicted): the chain CAS that removes the
            // record also rewrites the entry, so a fresh lookup will see the
            // main-log address; report a miss with no underlying hint.
            return miss(Address::INVALID);
        }

        let page = self.page_of(address);
        let slot = self.slot(page);
        if !slot.holds(page) {
            return miss(Address::INVALID);
        }

        let offset = address.offset(self.config.page_bits) as usize;
        // SAFETY: resident page under epoch protection; eviction drains
        // before the buffer is recycled.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                slot.buffer.as_ptr().add(offset),
                self.config.page_size() as usize - offset,
            )
        };
        let record = match parse_record::<K, V>(bytes) {
            Ok(ParsedRecord::Ok(record)) => record,
            _ => return miss(Address::INVALID),
        };
        let underlying = record.previous_address();

        if record.is_invalid() {
            return miss(underlying);
        }
        match <K as StoreKey>::Codec::equals_encoded(record.key, key) {
            Ok(true) => {}
            _ => return miss(underlying),
        }
        let Some(value_bytes) = record.value else {
            return miss(underlying);
        };
        let Ok(value) = <V as StoreValue>::Codec::decode(value_bytes) else {
            return miss(underlying);
        };

        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        CacheHit {
            value: Some(value),
            underlying,
            refresh: address < self.refresh_boundary(),
        }
    }

    /// Insert `key → value` shadowing main-log address `main_address`, and
    /// swing the hash entry from `expected` to the new cache record.
    ///
    /// Best effort: allocation pressure or a lost CAS just skips caching.
    pub fn try_insert(
        &self,
        index: &HashIndex,
        hash: KeyHash,
        expected: &crate::index::FindSlot,
        key: &K,
        value: &V,
        main_address: Address,
    ) -> bool {
        let Ok(layout) = RecordLayout::for_write::<K, V>(key, Some(value)) else {
            return false;
        };
        let Some(address) = self.allocate(index, layout.alloc_len as u64) else {
            return false;
        };

        let page = self.page_of(address);
        let slot = self.slot(page);
        let offset = address.offset(self.config.page_bits) as usize;
        // SAFETY: freshly reserved range of a resident page.
        let dst = unsafe {
            std::slice::from_raw_parts_mut(
                slot.buffer.as_mut_ptr().add(offset),
                layout.alloc_len,
            )
        };
        let header = RecordHeader::pack(main_address, 0, false, false);
        if write_record::<K, V>(dst, &layout, header, key, Some(value)).is_err() {
            return false;
        }

        let installed =
            index.try_update_entry(expected, address.with_read_cache_bit(), hash.tag());
        if installed {
            self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        } else {
            // Lost the race; retire the orphan record.
            // SAFETY: record bytes were just written at this address.
            unsafe { record::header_at(slot.buffer.as_ptr().add(offset)) }.set_invalid();
        }
        installed
    }

    /// Mark the cache record at `entry_address` invalid if it holds `key`
    /// (called before an update supersedes it). Returns the shadowed
    /// main-log address.
    pub fn invalidate(&self, entry_address: Address, key: &K) -> Address {
        debug_assert!(entry_address.in_read_cache());
        let address = entry_address.without_read_cache_bit();
        let page = self.page_of(address);
        let slot = self.slot(page);
        if !slot.holds(page) || address < self.safe_head.load(Ordering::Acquire) {
            return Address::INVALID;
        }
        let offset = address.offset(self.config.page_bits) as usize;
        // SAFETY: resident page under epoch protection.
        let bytes = unsafe {
            std::slice::from_raw_parts(
                slot.buffer.as_ptr().add(offset),
                self.config.page_size() as usize - offset,
            )
        };
        match parse_record::<K, V>(bytes) {
            Ok(ParsedRecord::Ok(record)) => {
                let underlying = record.previous_address();
                if matches!(
                    <K as StoreKey>::Codec::equals_encoded(record.key, key),
                    Ok(true)
                ) {
                    // SAFETY: header lives at the record start.
                    unsafe { record::header_at(slot.buffer.as_ptr().add(offset)) }.set_invalid();
                }
                underlying
            }
            _ => Address::INVALID,
        }
    }

    /// Resolve a cache entry address to the main-log address it shadows
    /// without touching hit statistics.
    pub fn skip(&self, entry_address: Address) -> Address {
        debug_assert!(entry_address.in_read_cache());
        let address = entry_address.without_read_cache_bit();
        let page = self.page_of(address);
        let slot = self.slot(page);
        if !slot.holds(page) || address < self.safe_head.load(Ordering::Acquire) {
            return Address::INVALID;
        }
        let offset = address.offset(self.config.page_bits) as usize;
        // SAFETY: resident page under epoch protection.
        let bytes = unsafe {
            std::slice::from_raw_parts(slot.buffer.as_ptr().add(offset), record::HEADER_SIZE)
        };
        let control = u64::from_le_bytes(bytes.try_into().expect("8 bytes"));
        RecordHeader::from_control(control).previous_address()
    }

    fn allocate(&self, index: &HashIndex, len: u64) -> Option<Address> {
        let page_size = self.config.page_size();
        if len > page_size {
            return None;
        }
        for _ in 0..8 {
            let reserved = self.tail.reserve(len);
            let page = reserved.page();
            let offset = reserved.offset();
            if offset + len <= page_size {
                let slot = self.slot(page);
                if !slot.holds(page) {
                    // Roll winner has not opened the page yet.
                    std::thread::yield_now();
                    continue;
                }
                return Some(Address::new(
                    (page << self.config.page_bits) + offset,
                ));
            }

            let next = page + 1;
            if !self.prepare_page(index, next) {
                return None;
            }
            let (_, won) = self.tail.try_new_page(page);
            if won {
                let slot = self.slot(next);
                slot.buffer.clear();
                slot.owner.store(next + 1, Ordering::Release);
            }
        }
        None
    }

    /// Make `page`'s ring slot available, evicting its previous occupant.
    fn prepare_page(&self, index: &HashIndex, page: u64) -> bool {
        let slot = self.slot(page);
        let owner = match slot.owner.load(Ordering::Acquire) {
            0 => return true,
            n => n - 1,
        };
        if owner == page {
            return true;
        }

        let evict_boundary = self.page_start(owner + 1);
        if self.head.advance_to(evict_boundary) {
            // Unlink the outgoing records, then let the drain confirm that
            // no reader still holds a pointer into the page.
            self.evict_page_records(index, owner);
            let safe_head = self.safe_head.clone();
            self.epoch.bump_with_action(move || {
                safe_head.advance_to(evict_boundary);
            });
        }
        // Recyclable only after the drain confirmed the boundary.
        if self.safe_head.load(Ordering::Acquire) >= evict_boundary {
            slot.owner.store(0, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// CAS outgoing records off their hash chains; a second look shows the
    /// main-log address they shadowed.
    fn evict_page_records(&self, index: &HashIndex, page: u64) {
        let slot = self.slot(page);
        if !slot.holds(page) {
            return;
        }
        let page_size = self.config.page_size() as usize;
        let base = self.page_start(page);
        let mut offset = if page == 0 {
            FIRST_LOG_ADDRESS as usize
        } else {
            0
        };
        let mut evicted = 0u64;

        while offset + record::HEADER_SIZE <= page_size {
            // SAFETY: resident page; eviction runs before the slot recycles.
            let bytes = unsafe {
                std::slice::from_raw_parts(slot.buffer.as_ptr().add(offset), page_size - offset)
            };
            let record = match parse_record::<K, V>(bytes) {
                Ok(ParsedRecord::Ok(record)) => record,
                _ => break,
            };
            let advance = record::record_alloc_len::<K, V>(&record);
            let cache_address = (base + offset as u64).with_read_cache_bit();

            let hash = KeyHash::new(<K as StoreKey>::Codec::hash_encoded(record.key));
            let found = index.find_entry(hash);
            if found.found() && found.entry.address() == cache_address {
                // Best effort: when the CAS loses, a newer head already
                // bypasses this record.
                index.try_unlink_entry(&found, record.previous_address(), hash.tag());
            }
            evicted += 1;
            offset += advance;
        }
        self.stats
            .evicted_records
            .fetch_add(evicted, Ordering::Relaxed);
    }
}
