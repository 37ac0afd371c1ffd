//! The store engine: construction, the read/upsert/RMW/delete state
//! machine, pending-I/O completion, and observability accessors.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::Address;
use crate::cache::ReadCache;
use crate::checkpoint::{
    AtomicSystemState, CheckpointManager, CheckpointToken, CheckpointVariant, CommitPoint,
    LocalCheckpointManager,
};
use crate::codec::{KeyCodec, StoreKey, StoreValue, ValueCodec};
use crate::device::SyncDevice;
use crate::epoch::EpochManager;
use crate::hlog::{HybridLog, LogStats};
use crate::index::{FindSlot, HashIndex, IndexStats, KeyHash};
use crate::record::{
    self, parse_record, parse_record_at, write_record, ParsedRecord, RecordHeader, RecordLayout,
    RecordRef,
};
use crate::status::{OpKind, OpStatus, Status};
use crate::store::checkpoint_ops::{CheckpointOutcome, CprCoordinator};
use crate::store::context::{PendingOp, RetryPayload, SessionState};
use crate::store::functions::StoreFunctions;
use crate::store::io_worker::{IoWorker, ReadRequest};
use crate::store::settings::{CheckpointBackend, SettingsError, StoreSettings};

/// Initial probe size for disk record reads; records larger than this cost
/// a second round trip.
const DISK_READ_PROBE: usize = 4096;

/// The hybrid-log key-value store.
pub struct TideKv<K, V, F, D>
where
    K: StoreKey,
    V: StoreValue,
    F: StoreFunctions<K, V>,
    D: SyncDevice,
{
    pub(crate) epoch: Arc<EpochManager>,
    pub(crate) state: AtomicSystemState,
    /// Mutated structurally only by the single state-machine driver (grow,
    /// recovery); concurrent entry access is CAS-based and goes through
    /// `&self`.
    index: UnsafeCell<HashIndex>,
    pub(crate) hlog: HybridLog<D>,
    pub(crate) cache: Option<ReadCache<K, V>>,
    pub(crate) functions: F,
    pub(crate) io: IoWorker,
    pub(crate) sessions: Mutex<HashMap<Uuid, Arc<SessionState<K, F::Input>>>>,
    pub(crate) checkpoint_manager: Option<Arc<dyn CheckpointManager>>,
    pub(crate) checkpoint_variant: CheckpointVariant,
    pub(crate) relaxed_cpr: bool,
    pub(crate) copy_reads_to_tail: bool,
    pub(crate) cpr: CprCoordinator,
    pub(crate) checkpoint_outcomes: Mutex<HashMap<CheckpointToken, CheckpointOutcome>>,
    pub(crate) checkpoint_sequence: AtomicU64,
    pub(crate) recovered_sessions: Mutex<HashMap<Uuid, CommitPoint>>,
}

// SAFETY: interior mutability is confined to atomics, mutexes, and the
// state-machine-guarded index cell.
unsafe impl<K, V, F, D> Send for TideKv<K, V, F, D>
where
    K: StoreKey,
    V: StoreValue,
    F: StoreFunctions<K, V>,
    D: SyncDevice,
{
}

unsafe impl<K, V, F, D> Sync for TideKv<K, V, F, D>
where
    K: StoreKey,
    V: StoreValue,
    F: StoreFunctions<K, V>,
    D: SyncDevice,
{
}

/// Result of one in-memory chain walk.
enum ChainHit {
    /// The key's newest record is at this address.
    Found { address: Address, tombstone: bool },
    /// The chain ended without the key.
    Missing,
    /// The walk fell below the eviction boundary.
    OnDisk(Address),
}

impl<K, V, F, D> TideKv<K, V, F, D>
where
    K: StoreKey,
    V: StoreValue,
    F: StoreFunctions<K, V>,
    D: SyncDevice,
{
    pub fn new(settings: StoreSettings, functions: F, device: Arc<D>) -> Result<Self, SettingsError> {
        let (table_size, log_config) = settings.resolve()?;

        let epoch = Arc::new(EpochManager::new());
        let index = HashIndex::new(table_size);
        let hlog = HybridLog::new(log_config, device.clone(), epoch.clone());
        let cache = settings
            .log
            .read_cache
            .as_ref()
            .map(|config| ReadCache::new(config.clone(), epoch.clone()));

        let (checkpoint_manager, checkpoint_variant) = match &settings.checkpoint {
            Some(checkpoint) => {
                let manager: Arc<dyn CheckpointManager> = match &checkpoint.backend {
                    CheckpointBackend::Directory(dir) => {
                        Arc::new(LocalCheckpointManager::new(dir)?)
                    }
                    CheckpointBackend::Manager(manager) => manager.clone(),
                };
                (Some(manager), checkpoint.variant)
            }
            None => (None, CheckpointVariant::default()),
        };

        Ok(Self {
            epoch,
            state: AtomicSystemState::default(),
            index: UnsafeCell::new(index),
            hlog,
            cache,
            functions,
            io: IoWorker::new(device),
            sessions: Mutex::new(HashMap::new()),
            checkpoint_manager,
            checkpoint_variant,
            relaxed_cpr: settings.relaxed_cpr,
            copy_reads_to_tail: settings.log.copy_reads_to_tail,
            cpr: CprCoordinator::default(),
            checkpoint_outcomes: Mutex::new(HashMap::new()),
            checkpoint_sequence: AtomicU64::new(0),
            recovered_sessions: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub(crate) fn index(&self) -> &HashIndex {
        // SAFETY: shared access; structural mutation happens only through
        // `index_mut` under the state machine.
        unsafe { &*self.index.get() }
    }

    /// # Safety
    /// Only the single state-machine driver (grow, recovery before any
    /// session exists) may call this.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn index_mut(&self) -> &mut HashIndex {
        &mut *self.index.get()
    }

    // ===== Observability =====

    /// Number of non-empty, non-tentative hash entries.
    pub fn entry_count(&self) -> u64 {
        self.index().entry_count()
    }

    /// Number of main hash buckets.
    pub fn index_size(&self) -> u64 {
        self.index().size()
    }

    pub fn index_stats(&self) -> IndexStats {
        self.index().stats()
    }

    pub fn log_stats(&self) -> LogStats {
        self.hlog.stats()
    }

    pub fn read_cache_stats(&self) -> Option<&crate::cache::ReadCacheStats> {
        self.cache.as_ref().map(|cache| cache.stats())
    }

    /// Truncate the log below `address`: drop dead index entries, advance
    /// the begin address, and delete whole device segments.
    pub fn truncate_until(&self, address: Address) -> std::io::Result<u64> {
        let cleared = self.index().truncate_below(address);
        self.hlog.shift_begin(address)?;
        Ok(cleared)
    }

    #[inline]
    pub(crate) fn key_hash(&self, key: &K) -> KeyHash {
        KeyHash::new(<K as StoreKey>::Codec::hash(key).unwrap_or(0))
    }

    // ===== Read =====

    /// One read attempt against memory and the read cache.
    pub(crate) fn try_read(&self, key: &K, input: &F::Input) -> Result<F::Output, ReadMiss> {
        let hash = self.key_hash(key);
        let slot = self.index().find_entry(hash);
        if !slot.found() {
            return Err(ReadMiss::NotFound);
        }

        let mut address = slot.entry.address();
        if address.in_read_cache() {
            let cache = self.cache.as_ref().expect("cache entry without cache");
            let hit = cache.probe(address, key);
            if let Some(value) = hit.value {
                if hit.refresh {
                    // Second chance: re-append the hot record at the cache
                    // tail (the stale copy ages out).
                    let current = self.index().find_entry(hash);
                    if current.found() && current.entry.address() == address {
                        cache.try_insert(self.index(), hash, &current, key, &value, hit.underlying);
                    }
                }
                return Ok(self.functions.concurrent_reader(key, input, &value));
            }
            if hit.underlying.is_invalid() {
                // Evicted under us; retry sees the rewritten entry.
                return Err(ReadMiss::Retry);
            }
            address = hit.underlying;
        }

        self.read_from_chain(address, key, input)
    }

    fn read_from_chain(
        &self,
        mut address: Address,
        key: &K,
        input: &F::Input,
    ) -> Result<F::Output, ReadMiss> {
        let begin = self.hlog.begin_address();
        loop {
            if address.is_invalid() || address < begin {
                return Err(ReadMiss::NotFound);
            }
            if self.hlog.is_on_disk(address) {
                return Err(ReadMiss::OnDisk(address));
            }
            // SAFETY: epoch-protected, address at or above the published
            // eviction boundary.
            let Some((ptr, limit)) = (unsafe { self.hlog.bytes_at(address) }) else {
                return Err(ReadMiss::OnDisk(address));
            };
            // SAFETY: ptr/limit from bytes_at.
            let record = match unsafe { parse_record_at::<K, V>(ptr, limit) } {
                Ok(record) => record,
                Err(_) => return Err(ReadMiss::NotFound),
            };
            if record.is_invalid() {
                address = record.previous_address();
                continue;
            }
            match <K as StoreKey>::Codec::equals_encoded(record.key, key) {
                Ok(true) => {
                    if record.is_tombstone() {
                        return Err(ReadMiss::NotFound);
                    }
                    if record.value.is_none() {
                        return Err(ReadMiss::NotFound);
                    }
                    return if self.hlog.is_mutable(address) {
                        let value =
                            self.decode_value_at(address).ok_or(ReadMiss::NotFound)?;
                        Ok(self.functions.concurrent_reader(key, input, &value))
                    } else {
                        let value_bytes = record.value.ok_or(ReadMiss::NotFound)?;
                        let value = <V as StoreValue>::Codec::decode(value_bytes)
                            .map_err(|_| ReadMiss::NotFound)?;
                        Ok(self.functions.single_reader(key, input, &value))
                    };
                }
                _ => address = record.previous_address(),
            }
        }
    }

    /// Probe the in-memory portion of the chain only.
    pub fn contains_key_in_memory(&self, key: &K, from_address: Option<Address>) -> Status {
        let hash = self.key_hash(key);
        let slot = self.index().find_entry(hash);
        if !slot.found() {
            return Status::NotFound;
        }
        let mut address = slot.entry.address();
        if address.in_read_cache() {
            if let Some(cache) = &self.cache {
                // A cache hit counts as in-memory.
                let hit = cache.probe(address, key);
                if hit.value.is_some() {
                    return Status::Ok;
                }
                address = hit.underlying;
            }
        }
        if let Some(floor) = from_address {
            if address < floor {
                return Status::NotFound;
            }
        }
        match self.walk_chain(address, key) {
            ChainHit::Found { tombstone, .. } => {
                if tombstone {
                    Status::NotFound
                } else {
                    Status::Ok
                }
            }
            ChainHit::Missing => Status::NotFound,
            ChainHit::OnDisk(_) => Status::NotFound,
        }
    }

    fn walk_chain(&self, mut address: Address, key: &K) -> ChainHit {
        let begin = self.hlog.begin_address();
        loop {
            if address.is_invalid() || address < begin {
                return ChainHit::Missing;
            }
            if self.hlog.is_on_disk(address) {
                return ChainHit::OnDisk(address);
            }
            // SAFETY: epoch-protected, above the eviction boundary.
            let Some((ptr, limit)) = (unsafe { self.hlog.bytes_at(address) }) else {
                return ChainHit::OnDisk(address);
            };
            // SAFETY: ptr/limit from bytes_at.
            let record = match unsafe { parse_record_at::<K, V>(ptr, limit) } {
                Ok(record) => record,
                Err(_) => return ChainHit::Missing,
            };
            if !record.is_invalid() {
                if let Ok(true) = <K as StoreKey>::Codec::equals_encoded(record.key, key) {
                    return ChainHit::Found {
                        address,
                        tombstone: record.is_tombstone(),
                    };
                }
            }
            address = record.previous_address();
        }
    }

    // ===== Upsert =====

    /// One upsert attempt, reported through the internal status codes: the
    /// dispatcher retries `RetryNow` immediately, `RetryLater` after an
    /// epoch refresh, and `CprShiftDetected` after re-observing the phase.
    pub(crate) fn try_upsert(
        &self,
        key: &K,
        value: &V,
        version: u32,
        in_new_version: bool,
    ) -> Result<(), OpStatus> {
        if self.state.version() != version {
            return Err(OpStatus::CprShiftDetected);
        }
        let hash = self.key_hash(key);
        let slot = self.index().find_or_create_entry(hash);
        let mut head = slot.entry.address();

        if head.in_read_cache() {
            let cache = self.cache.as_ref().expect("cache entry without cache");
            // The cached copy is about to be superseded.
            head = cache.invalidate(head, key);
            if head.is_invalid() {
                return Err(OpStatus::RetryNow);
            }
        }

        // In-place when the key's newest record is mutable and the
        // concurrent writer accepts.
        if head.is_valid() && self.hlog.is_mutable(head) {
            // SAFETY: mutable region, epoch-protected.
            if let Some((ptr, limit)) = unsafe { self.hlog.bytes_at(head) } {
                if let Ok(record) = unsafe { parse_record_at::<K, V>(ptr, limit) } {
                    if !record.is_invalid()
                        && !record.is_tombstone()
                        && matches!(
                            <K as StoreKey>::Codec::equals_encoded(record.key, key),
                            Ok(true)
                        )
                    {
                        match unsafe {
                            self.try_update_value_in_place(ptr, &record, |dst| {
                                self.functions.concurrent_writer(key, value, dst)
                            })
                        } {
                            InPlaceResult::Written => return Ok(()),
                            // A sealed record is being replaced; appending
                            // over it is still a correct blind write.
                            InPlaceResult::Sealed | InPlaceResult::Refused => {}
                        }
                    }
                }
            }
        }

        // Append path.
        let stored = self.functions.single_writer(key, value);
        self.append_record(&slot, hash, key, Some(&stored), head, version, in_new_version)
    }

    /// Decode, mutate, and re-encode a value in place under the record
    /// latch.
    ///
    /// # Safety
    /// `ptr` must point at the record parsed into `record`, inside a pinned
    /// mutable-region page.
    unsafe fn try_update_value_in_place(
        &self,
        ptr: *mut u8,
        record: &RecordRef<'_>,
        update: impl FnOnce(&mut V) -> bool,
    ) -> InPlaceResult {
        let Some(value_bytes) = record.value else {
            return InPlaceResult::Refused;
        };
        let offset = value_bytes.as_ptr() as usize - ptr as usize;
        let len = value_bytes.len();

        // The record latch serialises concurrent in-place updates and
        // mutable-region readers of the same record.
        let header = record::header_at(ptr);
        header.lock_exclusive();
        let result = (|| {
            if header.is_sealed() {
                // A copy-updater claimed this record; its replacement holds
                // the current value.
                return InPlaceResult::Sealed;
            }
            // Re-read under the latch: another updater may have raced in
            // between the parse and the lock.
            let current = std::slice::from_raw_parts(ptr.add(offset), len);
            let Ok(mut value) = <V as StoreValue>::Codec::decode(current) else {
                return InPlaceResult::Refused;
            };
            if !update(&mut value) {
                return InPlaceResult::Refused;
            }
            let Ok(new_len) = <V as StoreValue>::Codec::encoded_len(&value) else {
                return InPlaceResult::Refused;
            };
            if new_len != len {
                // Variable-length value changed size; take the append path.
                return InPlaceResult::Refused;
            }
            let dst = std::slice::from_raw_parts_mut(ptr.add(offset), new_len);
            match <V as StoreValue>::Codec::encode_into(&value, dst) {
                Ok(()) => InPlaceResult::Written,
                Err(_) => InPlaceResult::Refused,
            }
        })();
        header.unlock();
        result
    }

    /// Seal `address`'s record and decode its value as a copy-update
    /// source. `None` means the record was already sealed (retry against
    /// its replacement).
    ///
    /// # Safety
    /// `ptr` must point at the record at `address`, inside a pinned page at
    /// or above the confirmed append-only boundary.
    unsafe fn seal_and_decode(&self, ptr: *mut u8, record: &RecordRef<'_>) -> Option<V> {
        let value_bytes = record.value?;
        let offset = value_bytes.as_ptr() as usize - ptr as usize;
        let len = value_bytes.len();

        let header = record::header_at(ptr);
        header.lock_exclusive();
        let value = if header.is_sealed() {
            None
        } else {
            let current = std::slice::from_raw_parts(ptr.add(offset), len);
            match <V as StoreValue>::Codec::decode(current) {
                Ok(value) => {
                    header.seal();
                    Some(value)
                }
                Err(_) => None,
            }
        };
        header.unlock();
        value
    }

    /// Append one record and CAS the hash entry to it.
    #[allow(clippy::too_many_arguments)]
    fn append_record(
        &self,
        slot: &FindSlot,
        hash: KeyHash,
        key: &K,
        value: Option<&V>,
        previous: Address,
        version: u32,
        in_new_version: bool,
    ) -> Result<(), OpStatus> {
        let layout = match RecordLayout::for_write::<K, V>(key, value) {
            Ok(layout) => layout,
            Err(_) => return Err(OpStatus::Aborted),
        };
        let address = match self.hlog.allocate(layout.alloc_len as u64) {
            Ok(address) => address,
            Err(_) => return Err(OpStatus::RetryLater),
        };

        // SAFETY: freshly reserved bytes of an open page.
        let (ptr, _) = unsafe { self.hlog.bytes_at(address) }.expect("fresh allocation resident");
        let dst = unsafe { std::slice::from_raw_parts_mut(ptr, layout.alloc_len) };
        let tombstone = value.is_none();
        let header = RecordHeader::pack(previous, version, tombstone, in_new_version);
        if write_record::<K, V>(dst, &layout, header, key, value).is_err() {
            // SAFETY: we own the freshly written record.
            unsafe { record::header_at(ptr) }.set_invalid();
            return Err(OpStatus::Aborted);
        }

        if self.index().try_update_entry(slot, address, hash.tag()) {
            Ok(())
        } else {
            // Lost the CAS; retire the orphan and restart from the lookup.
            unsafe { record::header_at(ptr) }.set_invalid();
            Err(OpStatus::RetryNow)
        }
    }

    // ===== RMW =====

    /// One RMW attempt. Errors as in `try_upsert`, plus `OnDisk` when the
    /// chain descends below the eviction boundary.
    pub(crate) fn try_rmw(
        &self,
        key: &K,
        input: &F::Input,
        version: u32,
        in_new_version: bool,
    ) -> Result<(), RmwMiss> {
        if self.state.version() != version {
            return Err(RmwMiss::Op(OpStatus::CprShiftDetected));
        }
        let hash = self.key_hash(key);
        let slot = self.index().find_or_create_entry(hash);
        let mut head = slot.entry.address();

        if head.in_read_cache() {
            let cache = self.cache.as_ref().expect("cache entry without cache");
            head = cache.invalidate(head, key);
            if head.is_invalid() {
                return Err(RmwMiss::Op(OpStatus::RetryNow));
            }
        }

        // Locate the key's newest record and update according to its
        // region:
        // - mutable: in-place under the latch; if the updater refuses,
        //   seal the record and copy-update so no concurrent in-place
        //   increment can be lost;
        // - fuzzy (published but unconfirmed append-only boundary):
        //   sessions disagree on mutability — retry after a refresh;
        // - read-only: plain copy-update (the source cannot change);
        // - on disk: go pending.
        let old = match self.walk_chain(head, key) {
            ChainHit::Found { address, tombstone } => {
                if tombstone {
                    None
                } else if self.hlog.is_mutable(address) {
                    // SAFETY: resident mutable record under protection.
                    let Some((ptr, limit)) = (unsafe { self.hlog.bytes_at(address) }) else {
                        return Err(RmwMiss::Op(OpStatus::RetryNow));
                    };
                    let Ok(record) = (unsafe { parse_record_at::<K, V>(ptr, limit) }) else {
                        return Err(RmwMiss::Op(OpStatus::RetryNow));
                    };
                    match unsafe {
                        self.try_update_value_in_place(ptr, &record, |dst| {
                            self.functions.in_place_updater(key, input, dst)
                        })
                    } {
                        InPlaceResult::Written => return Ok(()),
                        InPlaceResult::Sealed => return Err(RmwMiss::Op(OpStatus::RetryNow)),
                        InPlaceResult::Refused => {
                            // Copy-update from a mutable source: seal it so
                            // late in-place updaters move to the new record.
                            let Some(value) = (unsafe { self.seal_and_decode(ptr, &record) })
                            else {
                                return Err(RmwMiss::Op(OpStatus::RetryNow));
                            };
                            let new_value = self.functions.copy_updater(key, input, &value);
                            return match self.append_record(
                                &slot,
                                hash,
                                key,
                                Some(&new_value),
                                head,
                                version,
                                in_new_version,
                            ) {
                                Ok(()) => Ok(()),
                                Err(status) => {
                                    // The replacement did not land; let
                                    // in-place updaters at the old record
                                    // proceed again.
                                    unsafe { record::header_at(ptr) }.unseal();
                                    Err(RmwMiss::Op(status))
                                }
                            };
                        }
                    }
                } else if address >= self.hlog.read_only_address() {
                    // Fuzzy region: wait for the boundary to drain.
                    return Err(RmwMiss::Op(OpStatus::RetryLater));
                } else {
                    match self.decode_value_at(address) {
                        Some(value) => Some(value),
                        None => return Err(RmwMiss::Op(OpStatus::RetryNow)),
                    }
                }
            }
            ChainHit::Missing => None,
            ChainHit::OnDisk(address) => return Err(RmwMiss::OnDisk(address)),
        };

        let new_value = match &old {
            Some(old) => self.functions.copy_updater(key, input, old),
            None => self.functions.initial_updater(key, input),
        };
        self.append_record(
            &slot,
            hash,
            key,
            Some(&new_value),
            head,
            version,
            in_new_version,
        )
        .map_err(RmwMiss::Op)
    }

    fn decode_value_at(&self, address: Address) -> Option<V> {
        // SAFETY: address was just confirmed in-memory under protection.
        let (ptr, limit) = unsafe { self.hlog.bytes_at(address) }?;
        let record = unsafe { parse_record_at::<K, V>(ptr, limit) }.ok()?;
        let value_bytes = record.value?;
        // In-place updaters can hold the record latch anywhere at or above
        // the confirmed append-only boundary; take it there so the decode
        // sees a complete value. Records below it are immutable (and may be
        // mid-flush, so their headers must not be touched).
        if address >= self.hlog.read_only_address() {
            let header = unsafe { record::header_at(ptr) };
            header.lock_exclusive();
            let value = <V as StoreValue>::Codec::decode(value_bytes).ok();
            header.unlock();
            value
        } else {
            <V as StoreValue>::Codec::decode(value_bytes).ok()
        }
    }

    /// Finish an RMW whose old value came back from disk. If the chain head
    /// moved since the I/O was issued, fall back to a fresh attempt.
    pub(crate) fn try_rmw_with_fetched(
        &self,
        key: &K,
        input: &F::Input,
        fetched_at: Address,
        old: Option<&V>,
        version: u32,
        in_new_version: bool,
    ) -> Result<(), RmwMiss> {
        let hash = self.key_hash(key);
        let slot = self.index().find_or_create_entry(hash);
        let head = slot.entry.address();
        let main_head = if head.in_read_cache() {
            self.cache
                .as_ref()
                .map(|cache| cache.skip(head))
                .unwrap_or(Address::INVALID)
        } else {
            head
        };
        if main_head != fetched_at {
            // Someone wrote this key (or its chain) meanwhile; the fetched
            // value may be stale. Re-run the in-memory path.
            return self.try_rmw(key, input, version, in_new_version);
        }

        let new_value = match old {
            Some(old) => self.functions.copy_updater(key, input, old),
            None => self.functions.initial_updater(key, input),
        };
        self.append_record(
            &slot,
            hash,
            key,
            Some(&new_value),
            head,
            version,
            in_new_version,
        )
        .map_err(RmwMiss::Op)
    }

    // ===== Delete =====

    /// One delete attempt. Errors as in `try_upsert`; `Ok(false)` = key not
    /// found.
    pub(crate) fn try_delete(
        &self,
        key: &K,
        version: u32,
        in_new_version: bool,
    ) -> Result<bool, OpStatus> {
        if self.state.version() != version {
            return Err(OpStatus::CprShiftDetected);
        }
        let hash = self.key_hash(key);
        let slot = self.index().find_entry(hash);
        if !slot.found() {
            return Ok(false);
        }
        let mut head = slot.entry.address();
        if head.in_read_cache() {
            let cache = self.cache.as_ref().expect("cache entry without cache");
            head = cache.invalidate(head, key);
            if head.is_invalid() {
                return Err(OpStatus::RetryNow);
            }
        }

        match self.walk_chain(head, key) {
            ChainHit::Found { address, tombstone } => {
                if tombstone {
                    return Ok(false);
                }
                // Best-effort unlink when the key's record is the chain
                // head with nothing older behind it: the entry can simply
                // vanish. Only mutable records qualify — an elided record
                // that already reached the device would resurrect on
                // recovery, a masked one cannot.
                if address == head && self.hlog.is_mutable(head) {
                    // SAFETY: record confirmed resident above.
                    if let Some((ptr, limit)) = unsafe { self.hlog.bytes_at(head) } {
                        if let Ok(record) = unsafe { parse_record_at::<K, V>(ptr, limit) } {
                            let previous = record.previous_address();
                            if previous.is_invalid()
                                && head >= self.hlog.begin_address()
                                && self.index().try_unlink_entry(&slot, previous, hash.tag())
                            {
                                // SAFETY: chain head we just unlinked.
                                unsafe { record::header_at(ptr) }.set_invalid();
                                return Ok(true);
                            }
                        }
                    }
                }
                // Tombstone masks the record (and any disk-resident
                // versions) on recovery.
                self.append_record(&slot, hash, key, None, head, version, in_new_version)
                    .map(|_| true)
            }
            ChainHit::Missing => Ok(false),
            // The chain continues on disk: append a tombstone blindly so
            // older versions stay masked.
            ChainHit::OnDisk(_) => self
                .append_record(&slot, hash, key, None, head, version, in_new_version)
                .map(|_| true),
        }
    }

    // ===== Pending I/O =====

    /// Park an operation waiting on a disk record and submit the read.
    pub(crate) fn enqueue_pending(
        &self,
        session: &Arc<SessionState<K, F::Input>>,
        kind: OpKind,
        key: &K,
        input: F::Input,
        address: Address,
        serial: u64,
    ) {
        let mut ctx = session.ctx.lock();
        let id = ctx.allocate_pending_id();
        let version = ctx.version;
        ctx.io_pending.insert(
            id,
            PendingOp {
                id,
                serial,
                kind,
                key: key.clone(),
                input,
                address,
                version,
            },
        );
        drop(ctx);
        self.submit_read(session.guid, id, address, DISK_READ_PROBE);
    }

    fn submit_read(&self, guid: Uuid, pending_id: u64, address: Address, len: usize) {
        let page_bits = self.hlog.config().page_bits;
        let page_remaining = (self.hlog.config().page_size() - address.offset(page_bits)) as usize;
        let len = len.min(page_remaining);
        self.io.submit(ReadRequest {
            guid,
            pending_id,
            address,
            len,
        });
    }

    /// Route completed I/Os to their sessions and process everything queued
    /// for `session`. `caller_tid` is the epoch slot of the thread running
    /// this call (the session owner, or the checkpoint driver helping it).
    /// Returns true if any work was done.
    pub(crate) fn pump_session(
        &self,
        session: &Arc<SessionState<K, F::Input>>,
        caller_tid: usize,
    ) -> bool {
        let mut progressed = false;

        for completion in self.io.drain() {
            let target = if completion.guid == session.guid {
                Some(session.clone())
            } else {
                self.sessions.lock().get(&completion.guid).cloned()
            };
            let Some(target) = target else {
                // Session stopped with I/O in flight; drop the orphan.
                continue;
            };
            let mut ctx = target.ctx.lock();
            if let Some(op) = ctx.take_pending(completion.pending_id) {
                let payload = match completion.result {
                    Ok(bytes) => RetryPayload::Record(bytes),
                    Err(error) => {
                        tracing::warn!(%error, "pending read failed");
                        RetryPayload::IoError
                    }
                };
                ctx.retries.push_back((op, payload));
            }
        }

        loop {
            let next = session.ctx.lock().retries.pop_front();
            let Some((op, payload)) = next else { break };
            progressed = true;
            match payload {
                RetryPayload::Record(bytes) => {
                    self.complete_disk_op(session, op, bytes, caller_tid)
                }
                RetryPayload::IoError => self.fail_op(&op),
            }
        }
        progressed
    }

    fn fail_op(&self, op: &PendingOp<K, F::Input>) {
        match op.kind {
            OpKind::Read => {
                self.functions
                    .read_completed(&op.key, op.serial, Status::IoError, None)
            }
            OpKind::Rmw => self
                .functions
                .rmw_completed(&op.key, op.serial, Status::IoError),
            _ => {}
        }
    }

    /// Process one fetched record for a parked operation.
    fn complete_disk_op(
        &self,
        session: &Arc<SessionState<K, F::Input>>,
        mut op: PendingOp<K, F::Input>,
        bytes: Vec<u8>,
        caller_tid: usize,
    ) {
        let parsed = match parse_record::<K, V>(&bytes) {
            Ok(ParsedRecord::Ok(record)) => Some(record),
            Ok(ParsedRecord::Truncated(needed)) => {
                // Short probe: reissue with the exact length.
                let address = op.address;
                let guid = session.guid;
                let id = op.id;
                session.ctx.lock().reinsert_pending(op);
                self.submit_read(guid, id, address, needed);
                return;
            }
            Err(_) => None,
        };

        let Some(record) = parsed else {
            // Zeroed or corrupt bytes: nothing durable at this address.
            self.finish_disk_op(session, op, None, caller_tid);
            return;
        };

        let matches = !record.is_invalid()
            && matches!(
                <K as StoreKey>::Codec::equals_encoded(record.key, &op.key),
                Ok(true)
            );
        if matches {
            let value = if record.is_tombstone() {
                None
            } else {
                record
                    .value
                    .and_then(|bytes| <V as StoreValue>::Codec::decode(bytes).ok())
            };
            self.finish_disk_op(session, op, value, caller_tid);
            return;
        }

        // Wrong key: keep walking the chain.
        let previous = record.previous_address();
        if previous.is_invalid() || previous < self.hlog.begin_address() {
            self.finish_disk_op(session, op, None, caller_tid);
        } else if self.hlog.is_on_disk(previous) {
            op.address = previous;
            let guid = session.guid;
            let id = op.id;
            session.ctx.lock().reinsert_pending(op);
            self.submit_read(guid, id, previous, DISK_READ_PROBE);
        } else {
            // The rest of the chain is in memory.
            match self.walk_chain(previous, &op.key) {
                ChainHit::Found { address, tombstone } => {
                    let value = if tombstone {
                        None
                    } else {
                        self.decode_value_at(address)
                    };
                    self.finish_disk_op(session, op, value, caller_tid);
                }
                ChainHit::Missing => self.finish_disk_op(session, op, None, caller_tid),
                ChainHit::OnDisk(address) => {
                    op.address = address;
                    let guid = session.guid;
                    let id = op.id;
                    session.ctx.lock().reinsert_pending(op);
                    self.submit_read(guid, id, address, DISK_READ_PROBE);
                }
            }
        }
    }

    /// The fetched value (or its absence) is final; run the operation's
    /// completion.
    fn finish_disk_op(
        &self,
        session: &Arc<SessionState<K, F::Input>>,
        op: PendingOp<K, F::Input>,
        value: Option<V>,
        caller_tid: usize,
    ) {
        match op.kind {
            OpKind::Read => {
                match &value {
                    Some(value) => {
                        self.install_read_copy(&op.key, value, op.address);
                        let output = self.functions.single_reader(&op.key, &op.input, value);
                        self.functions
                            .read_completed(&op.key, op.serial, Status::Ok, Some(output));
                    }
                    None => {
                        self.functions
                            .read_completed(&op.key, op.serial, Status::NotFound, None);
                    }
                }
            }
            OpKind::Rmw => {
                let mut attempts = 0u32;
                loop {
                    let (version, in_new_version) = self.session_write_stamp(session);
                    match self.try_rmw_with_fetched(
                        &op.key,
                        &op.input,
                        op.address,
                        value.as_ref(),
                        version,
                        in_new_version,
                    ) {
                        Ok(()) => {
                            self.functions.rmw_completed(&op.key, op.serial, Status::Ok);
                            return;
                        }
                        Err(RmwMiss::Op(OpStatus::RetryNow)) => {}
                        Err(RmwMiss::Op(_)) => {
                            self.epoch.refresh(caller_tid);
                            std::thread::yield_now();
                        }
                        Err(RmwMiss::OnDisk(address)) => {
                            // The chain moved and points below the eviction
                            // boundary again; park once more, keeping the
                            // frame in its original version context.
                            let mut ctx = session.ctx.lock();
                            let id = ctx.allocate_pending_id();
                            ctx.reinsert_pending(PendingOp {
                                id,
                                serial: op.serial,
                                kind: OpKind::Rmw,
                                key: op.key.clone(),
                                input: op.input.clone(),
                                address,
                                version: op.version,
                            });
                            drop(ctx);
                            self.submit_read(session.guid, id, address, DISK_READ_PROBE);
                            return;
                        }
                    }
                    attempts += 1;
                    if attempts % 1024 == 0 {
                        self.epoch.refresh(caller_tid);
                    }
                }
            }
            OpKind::Upsert | OpKind::Delete => unreachable!("blind writes never go pending"),
        }
    }

    /// After serving a read from disk, keep a copy close: in the read cache
    /// when enabled, else (optionally) at the log tail.
    fn install_read_copy(&self, key: &K, value: &V, fetched_at: Address) {
        let hash = self.key_hash(key);
        let slot = self.index().find_entry(hash);
        if !slot.found() {
            return;
        }
        let head = slot.entry.address();
        if head.in_read_cache() {
            // Someone already cached a copy.
            return;
        }
        if head != fetched_at {
            // The key was updated while the read was in flight; the fetched
            // value is stale, do not promote it.
            return;
        }

        if let Some(cache) = &self.cache {
            cache.try_insert(self.index(), hash, &slot, key, value, head);
        } else if self.copy_reads_to_tail {
            let (version, in_new_version) = (self.state.version(), false);
            let _ = self.append_record(
                &slot,
                hash,
                key,
                Some(value),
                head,
                version,
                in_new_version,
            );
        }
    }

    /// Current write stamp for a session: its version and whether records
    /// must carry the new-version mark (checkpoint in flight, session
    /// already bumped).
    pub(crate) fn session_write_stamp(
        &self,
        session: &Arc<SessionState<K, F::Input>>,
    ) -> (u32, bool) {
        let ctx = session.ctx.lock();
        let version = ctx.version;
        drop(ctx);
        let in_new_version = self
            .cpr
            .with_active(|active| version > active.base_version)
            .unwrap_or(false);
        (version, in_new_version)
    }

    /// Encoded key hash for the record at `address`, reading from memory or
    /// the device (used by index growth).
    pub(crate) fn key_hash_at(&self, address: Address) -> Option<KeyHash> {
        let main = address.without_read_cache_bit();
        if address.in_read_cache() {
            return None;
        }
        if !self.hlog.is_on_disk(main) {
            // SAFETY: grow driver holds epoch protection.
            if let Some((ptr, limit)) = unsafe { self.hlog.bytes_at(main) } {
                if let Ok(record) = unsafe { parse_record_at::<K, V>(ptr, limit) } {
                    return Some(KeyHash::new(<K as StoreKey>::Codec::hash_encoded(record.key)));
                }
            }
        }
        // Synchronous device read; growth is rare and not latency-bound.
        let mut len = DISK_READ_PROBE;
        for _ in 0..2 {
            let mut buf = vec![0u8; len];
            if self
                .hlog
                .device()
                .read_at(main.control(), &mut buf)
                .is_err()
            {
                return None;
            }
            match parse_record::<K, V>(&buf) {
                Ok(ParsedRecord::Ok(record)) => {
                    return Some(KeyHash::new(<K as StoreKey>::Codec::hash_encoded(record.key)))
                }
                Ok(ParsedRecord::Truncated(needed)) => len = needed,
                Err(_) => return None,
            }
        }
        None
    }
}

/// Result of an in-place value update attempt.
enum InPlaceResult {
    Written,
    /// The callback refused or the new encoding did not fit.
    Refused,
    /// A copy-updater sealed the record; the replacement holds the value.
    Sealed,
}

/// Why a read attempt did not produce a value.
pub(crate) enum ReadMiss {
    NotFound,
    /// Record lives below the eviction boundary; go pending at this address.
    OnDisk(Address),
    /// Transient (cache eviction raced); retry immediately.
    Retry,
}

/// Why an RMW attempt did not finish.
pub(crate) enum RmwMiss {
    /// Internal status (retry now/later, CPR shift, abort).
    Op(OpStatus),
    /// The chain descends below the eviction boundary; park the operation.
    OnDisk(Address),
}
