//! The hybrid log allocator: tail reservation, page sealing and flush,
//! frontier advancement, and eviction gated by epoch drain.
//!
//! Frontier protocol (maintaining `begin ≤ head ≤ safe_head ≤ read_only ≤
//! safe_read_only ≤ tail`):
//!
//! - `safe_read_only` is the *published* end of the append-only region;
//!   in-place updates are permitted only at or above it. Once every thread
//!   has observed it (epoch drain), `read_only` follows, and pages wholly
//!   below `read_only` are handed to the flush worker — nothing can scribble
//!   on them anymore.
//! - `safe_head` is the *published* eviction boundary; readers treat
//!   addresses below it as on-disk. Once drained, `head` follows, and ring
//!   slots whose page ends at or below `head` (and whose flush completed)
//!   may be recycled.

use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::address::{Address, AtomicAddress, AtomicTailOffset, TailOffset};
use crate::device::SyncDevice;
use crate::epoch::EpochManager;
use crate::status::Status;

use super::page::{PageSlot, PAGE_OPEN};
use super::{FlushState, LogConfig, FIRST_LOG_ADDRESS};

/// Frontier snapshot plus region byte counts.
#[derive(Debug, Clone)]
pub struct LogStats {
    pub begin_address: Address,
    pub head_address: Address,
    pub safe_head_address: Address,
    pub read_only_address: Address,
    pub safe_read_only_address: Address,
    pub flushed_until_address: Address,
    pub tail_address: Address,
    pub mutable_bytes: u64,
    pub read_only_bytes: u64,
    pub on_disk_bytes: u64,
}

enum FlushRequest {
    /// Write one immutable page to the device.
    Page { slot: usize, page: u64 },
    Shutdown,
}

struct LogShared<D: SyncDevice> {
    config: LogConfig,
    device: Arc<D>,
    epoch: Arc<EpochManager>,
    slots: Box<[PageSlot]>,

    tail: AtomicTailOffset,
    begin: AtomicAddress,
    head: AtomicAddress,
    safe_head: AtomicAddress,
    read_only: AtomicAddress,
    safe_read_only: AtomicAddress,
    flushed_until: AtomicAddress,

    /// Next page to hand to the flush worker once `read_only` passes it.
    next_flush_page: AtomicU64,
    /// Pages whose device write completed, pending incorporation into
    /// `flushed_until`.
    flushed_pages: Mutex<BTreeSet<u64>>,
    flush_tx: Sender<FlushRequest>,
}

impl<D: SyncDevice> LogShared<D> {
    #[inline]
    fn slot(&self, page: u64) -> &PageSlot {
        &self.slots[(page % self.slots.len() as u64) as usize]
    }

    #[inline]
    fn page_size(&self) -> u64 {
        self.config.page_size()
    }

    /// Confirm the append-only boundary after a drain, then queue flushes
    /// for every page that became wholly immutable.
    fn confirm_read_only(self: &Arc<Self>, target: Address) {
        self.read_only.advance_to(target);
        self.submit_flushes_below(self.read_only.load(Ordering::Acquire));
    }

    fn submit_flushes_below(self: &Arc<Self>, boundary: Address) {
        loop {
            let page = self.next_flush_page.load(Ordering::Acquire);
            if self.config.page_start(page + 1) > boundary {
                return;
            }
            if self
                .next_flush_page
                .compare_exchange(page, page + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let slot_index = (page % self.slots.len() as u64) as usize;
            if self
                .flush_tx
                .send(FlushRequest::Page {
                    slot: slot_index,
                    page,
                })
                .is_err()
            {
                // Worker already shut down; flush inline.
                self.flush_page(slot_index, page);
            }
        }
    }

    /// Flush one immutable page and fold the completion into
    /// `flushed_until`.
    fn flush_page(&self, slot_index: usize, page: u64) {
        let slot = &self.slots[slot_index];
        if !slot.holds(page) {
            // Already recycled: a checkpoint flush covered it first.
            self.complete_page_flush(page);
            return;
        }
        slot.seal();
        let offset = self.config.page_start(page).control();
        // SAFETY: the slot cannot be recycled before its flush completes and
        // the head frontier passes it, so the buffer outlives this write.
        let bytes = slot.buffer.as_slice();
        match self.device.write_at(offset, bytes) {
            Ok(()) => {
                slot.mark_flushed(page);
                self.complete_page_flush(page);
            }
            Err(error) => {
                // The page stays sealed-but-unflushed; allocation stalls at
                // the ring rather than dropping data.
                tracing::warn!(page, %error, "page flush failed");
            }
        }
    }

    fn complete_page_flush(&self, page: u64) {
        let mut flushed = self.flushed_pages.lock();
        flushed.insert(page);
        loop {
            let until = self.flushed_until.load(Ordering::Acquire);
            let next_page = self.config.page_of(until);
            // Drop completions a checkpoint flush already advanced past.
            while let Some(&first) = flushed.first() {
                if first < next_page {
                    flushed.pop_first();
                } else {
                    break;
                }
            }
            if flushed.remove(&next_page) {
                self.flushed_until
                    .advance_to(self.config.page_start(next_page + 1));
            } else {
                break;
            }
        }
    }
}

/// The hybrid log.
///
/// All mutation is through `&self`; page bytes are reached via raw pointers
/// under the epoch discipline (a page below the published safe head is never
/// touched, a slot is recycled only once its previous owner is flushed and
/// the confirmed head passed it).
pub struct HybridLog<D: SyncDevice> {
    shared: Arc<LogShared<D>>,
    flush_worker: Mutex<Option<JoinHandle<()>>>,
}

impl<D: SyncDevice> HybridLog<D> {
    pub fn new(config: LogConfig, device: Arc<D>, epoch: Arc<EpochManager>) -> Self {
        let page_size = config.page_size() as usize;
        let memory_pages = config.memory_pages();
        assert!(memory_pages >= 2, "memory budget must hold at least 2 pages");
        let sector = device.sector_size();

        let slots: Box<[PageSlot]> = (0..memory_pages)
            .map(|_| PageSlot::new(page_size, sector))
            .collect();
        // Page zero starts open; the log's first usable byte skips the null
        // cache line so no record ever lands at address zero.
        slots[0].open_for(0);

        let start = Address::new(FIRST_LOG_ADDRESS);
        let (flush_tx, flush_rx) = unbounded();
        let shared = Arc::new(LogShared {
            config,
            device,
            epoch,
            slots,
            tail: AtomicTailOffset::new(TailOffset::new(0, FIRST_LOG_ADDRESS)),
            begin: AtomicAddress::new(start),
            head: AtomicAddress::new(start),
            safe_head: AtomicAddress::new(start),
            read_only: AtomicAddress::new(start),
            safe_read_only: AtomicAddress::new(start),
            flushed_until: AtomicAddress::new(start),
            next_flush_page: AtomicU64::new(0),
            flushed_pages: Mutex::new(BTreeSet::new()),
            flush_tx,
        });

        let worker_shared = shared.clone();
        let flush_worker = thread::Builder::new()
            .name("tidekv-flush".into())
            .spawn(move || Self::flush_loop(worker_shared, flush_rx))
            .expect("spawn flush worker");

        Self {
            shared,
            flush_worker: Mutex::new(Some(flush_worker)),
        }
    }

    fn flush_loop(shared: Arc<LogShared<D>>, rx: Receiver<FlushRequest>) {
        while let Ok(request) = rx.recv() {
            match request {
                FlushRequest::Page { slot, page } => shared.flush_page(slot, page),
                FlushRequest::Shutdown => break,
            }
        }
    }

    #[inline]
    pub fn config(&self) -> &LogConfig {
        &self.shared.config
    }

    #[inline]
    pub fn device(&self) -> &Arc<D> {
        &self.shared.device
    }

    // ===== Frontier accessors =====

    #[inline]
    pub fn begin_address(&self) -> Address {
        self.shared.begin.load(Ordering::Acquire)
    }

    #[inline]
    pub fn head_address(&self) -> Address {
        self.shared.head.load(Ordering::Acquire)
    }

    #[inline]
    pub fn safe_head_address(&self) -> Address {
        self.shared.safe_head.load(Ordering::Acquire)
    }

    #[inline]
    pub fn read_only_address(&self) -> Address {
        self.shared.read_only.load(Ordering::Acquire)
    }

    #[inline]
    pub fn safe_read_only_address(&self) -> Address {
        self.shared.safe_read_only.load(Ordering::Acquire)
    }

    #[inline]
    pub fn flushed_until_address(&self) -> Address {
        self.shared.flushed_until.load(Ordering::Acquire)
    }

    #[inline]
    pub fn tail_address(&self) -> Address {
        self.shared
            .tail
            .load(Ordering::Acquire)
            .to_address(self.shared.config.page_bits)
    }

    pub fn stats(&self) -> LogStats {
        let begin = self.begin_address();
        let head = self.head_address();
        let read_only = self.read_only_address();
        let tail = self.tail_address();
        LogStats {
            begin_address: begin,
            head_address: head,
            safe_head_address: self.safe_head_address(),
            read_only_address: read_only,
            safe_read_only_address: self.safe_read_only_address(),
            flushed_until_address: self.flushed_until_address(),
            tail_address: tail,
            mutable_bytes: tail - read_only,
            read_only_bytes: read_only - head,
            on_disk_bytes: head - begin,
        }
    }

    // ===== Region classification =====

    /// In-place updates are allowed only at or above the published
    /// append-only boundary.
    #[inline]
    pub fn is_mutable(&self, address: Address) -> bool {
        address >= self.safe_read_only_address()
    }

    /// Readers must treat addresses below the published eviction boundary
    /// as on-disk.
    #[inline]
    pub fn is_on_disk(&self, address: Address) -> bool {
        address < self.safe_head_address()
    }

    /// Whether `address` currently resides in a memory page.
    pub fn is_in_memory(&self, address: Address) -> bool {
        let page = self.shared.config.page_of(address);
        self.shared.slot(page).holds(page)
    }

    // ===== Allocation =====

    /// Reserve `len` bytes at the tail.
    ///
    /// `Err(Status::RetryLater)` means the ring is full and eviction is not
    /// yet safe; the caller must refresh its epoch (running drain actions)
    /// and retry. `Err(Status::InvalidArgument)` means the record exceeds
    /// the page size.
    pub fn allocate(&self, len: u64) -> Result<Address, Status> {
        if len > self.shared.page_size() {
            return Err(Status::InvalidArgument);
        }
        let page_size = self.shared.page_size();

        loop {
            let reserved = self.shared.tail.reserve(len);
            let page = reserved.page();
            let offset = reserved.offset();

            if offset + len <= page_size {
                // Wait for the roll winner to open the page; bounded by the
                // time that thread needs to clear one buffer.
                let slot = self.shared.slot(page);
                while !slot.holds(page) {
                    thread::yield_now();
                }
                return Ok(Address::new((page << self.shared.config.page_bits) + offset));
            }

            // The page overflowed. Everybody who lands here helps roll the
            // tail; the CAS winner opens the new page.
            let next = page + 1;
            if !self.can_open(next) {
                self.request_frontier_advance(next);
                return Err(Status::RetryLater);
            }
            let (_, won) = self.shared.tail.try_new_page(page);
            if won {
                self.open_page(next);
                self.shift_read_only_for(next);
            }
        }
    }

    /// Whether `page`'s ring slot is free (or recyclable right now).
    fn can_open(&self, page: u64) -> bool {
        let slot = self.shared.slot(page);
        match slot.owner() {
            None => true,
            Some(owner) if owner == page => true,
            Some(owner) => {
                let evict_boundary = self.shared.config.page_start(owner + 1);
                slot.state() == FlushState::Flushed && self.head_address() >= evict_boundary
            }
        }
    }

    fn open_page(&self, page: u64) {
        let slot = self.shared.slot(page);
        if !slot.holds(page) {
            slot.open_for(page);
        }
    }

    /// Advance the append-only boundary so at most `mutable_pages` stay
    /// in-place updatable once the tail enters `tail_page`.
    fn shift_read_only_for(&self, tail_page: u64) {
        let mutable_pages = self.shared.config.mutable_pages();
        if tail_page > mutable_pages {
            let target = self.shared.config.page_start(tail_page - mutable_pages);
            self.shift_read_only(target);
        }
    }

    /// Publish a new append-only boundary; after the epoch drain confirms
    /// it, pages below it are queued for flushing.
    pub fn shift_read_only(&self, target: Address) {
        if self.shared.safe_read_only.advance_to(target) {
            let shared = self.shared.clone();
            self.shared.epoch.bump_with_action(move || {
                shared.confirm_read_only(target);
            });
        }
    }

    /// Under memory pressure: push the append-only and eviction boundaries
    /// forward so the slot holding `page`'s predecessor becomes recyclable.
    fn request_frontier_advance(&self, page: u64) {
        let slot = self.shared.slot(page);
        let Some(owner) = slot.owner() else { return };
        let needed = self.shared.config.page_start(owner + 1);

        // Capacity overrides the mutable fraction: the mutable region
        // shrinks so the oldest page can leave memory.
        self.shift_read_only(needed);

        let candidate = needed
            .min(self.flushed_until_address())
            .min(self.read_only_address());
        if self.shared.safe_head.advance_to(candidate) {
            let shared = self.shared.clone();
            self.shared.epoch.bump_with_action(move || {
                shared.head.advance_to(candidate);
            });
        }
    }

    // ===== Record access =====

    /// Pointer to the record bytes at `address`, with the byte count left in
    /// its page, if the page is resident.
    ///
    /// # Safety
    /// Caller must hold epoch protection and must not dereference addresses
    /// below the published safe head.
    pub unsafe fn bytes_at(&self, address: Address) -> Option<(*mut u8, usize)> {
        let page = self.shared.config.page_of(address);
        let slot = self.shared.slot(page);
        if !slot.holds(page) {
            return None;
        }
        let offset = address.offset(self.shared.config.page_bits) as usize;
        let remaining = self.shared.page_size() as usize - offset;
        Some((slot.buffer.as_mut_ptr().add(offset), remaining))
    }

    // ===== Durability support =====

    /// Synchronously flush everything below `target` and make it durable.
    /// Used by the checkpoint WAIT_FLUSH phase, after the append-only
    /// boundary has been moved past `target`.
    pub fn flush_until(&self, target: Address) -> io::Result<()> {
        loop {
            let from = self.flushed_until_address();
            if from >= target {
                break;
            }
            let page = self.shared.config.page_of(from);
            let page_end = self.shared.config.page_start(page + 1);
            let chunk_end = target.min(page_end);
            let slot = self.shared.slot(page);
            if slot.holds(page) {
                let offset = from.offset(self.shared.config.page_bits) as usize;
                let len = (chunk_end - from) as usize;
                // SAFETY: the page is resident and cannot be recycled while
                // flushed_until (and therefore head) sits inside it.
                let bytes =
                    unsafe { std::slice::from_raw_parts(slot.buffer.as_ptr().add(offset), len) };
                self.shared.device.write_at(from.control(), bytes)?;
            }
            // A non-resident page was already written by the flush worker.
            self.shared.flushed_until.advance_to(chunk_end);
        }
        self.shared.device.sync()
    }

    /// Copy the in-memory byte range `[from, to)` into `out` (snapshot
    /// checkpoints). The range must be resident.
    pub fn copy_range(&self, from: Address, to: Address, out: &mut Vec<u8>) -> Result<(), Status> {
        let mut cursor = from;
        while cursor < to {
            let page = self.shared.config.page_of(cursor);
            let page_end = self.shared.config.page_start(page + 1);
            let chunk_end = to.min(page_end);
            let slot = self.shared.slot(page);
            if !slot.holds(page) {
                return Err(Status::Aborted);
            }
            let offset = cursor.offset(self.shared.config.page_bits) as usize;
            let len = (chunk_end - cursor) as usize;
            // SAFETY: resident page, epoch-protected caller.
            let bytes =
                unsafe { std::slice::from_raw_parts(slot.buffer.as_ptr().add(offset), len) };
            out.extend_from_slice(bytes);
            cursor = chunk_end;
        }
        Ok(())
    }

    /// Truncate the log prefix: advance the begin address and drop whole
    /// device segments below it.
    pub fn shift_begin(&self, target: Address) -> io::Result<()> {
        if self.shared.begin.advance_to(target) {
            self.shared.device.remove_below(target.control())?;
        }
        Ok(())
    }

    // ===== Recovery =====

    /// Reset the log to a recovered state: everything below `cut` is on the
    /// device; `tail_page_bytes` (the bytes from the start of `cut`'s page
    /// up to `cut`) is reloaded into memory so new appends continue in
    /// place.
    pub fn restore(&self, begin: Address, cut: Address, tail_page_bytes: &[u8]) {
        let page_bits = self.shared.config.page_bits;
        let tail_page = self.shared.config.page_of(cut);
        let page_head = self.shared.config.page_start(tail_page);
        debug_assert_eq!(tail_page_bytes.len() as u64, cut - page_head);

        self.shared.begin.store(begin, Ordering::Release);
        self.shared.head.store(page_head, Ordering::Release);
        self.shared.safe_head.store(page_head, Ordering::Release);
        self.shared.read_only.store(cut, Ordering::Release);
        self.shared.safe_read_only.store(cut, Ordering::Release);
        self.shared.flushed_until.store(cut, Ordering::Release);
        self.shared
            .tail
            .store(TailOffset::from_address(cut, page_bits), Ordering::Release);
        self.shared
            .next_flush_page
            .store(tail_page, Ordering::Release);

        let slot = self.shared.slot(tail_page);
        slot.open_for(tail_page);
        if !tail_page_bytes.is_empty() {
            // SAFETY: freshly opened slot; recovery is single-threaded.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    tail_page_bytes.as_ptr(),
                    slot.buffer.as_mut_ptr(),
                    tail_page_bytes.len(),
                );
            }
        }
        slot.adopt(tail_page, PAGE_OPEN);
        self.shared.flushed_pages.lock().clear();
    }

    /// Block until the background flush has made `target` durable.
    pub fn wait_for_flush(&self, target: Address) {
        while self.flushed_until_address() < target {
            thread::yield_now();
        }
    }
}

impl<D: SyncDevice> Drop for HybridLog<D> {
    fn drop(&mut self) {
        let _ = self.shared.flush_tx.send(FlushRequest::Shutdown);
        if let Some(worker) = self.flush_worker.lock().take() {
            let _ = worker.join();
        }
    }
}

// SAFETY: all shared mutation is atomic or epoch-gated.
unsafe impl<D: SyncDevice> Send for HybridLog<D> {}
unsafe impl<D: SyncDevice> Sync for HybridLog<D> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::NullDevice;

    fn test_log(page_bits: u32, memory_bits: u32) -> (HybridLog<NullDevice>, Arc<EpochManager>) {
        let epoch = Arc::new(EpochManager::new());
        let log = HybridLog::new(
            LogConfig::new(page_bits, memory_bits, 0.5),
            Arc::new(NullDevice::new()),
            epoch.clone(),
        );
        (log, epoch)
    }

    #[test]
    fn first_allocation_skips_null_line() {
        let (log, _epoch) = test_log(12, 16);
        let addr = log.allocate(64).unwrap();
        assert_eq!(addr, Address::new(FIRST_LOG_ADDRESS));
        let next = log.allocate(64).unwrap();
        assert_eq!(next, Address::new(FIRST_LOG_ADDRESS + 64));
    }

    #[test]
    fn page_boundary_rolls_to_next_page() {
        let (log, _epoch) = test_log(12, 16);
        // Fill the rest of page 0 (4096 - 64 usable bytes).
        log.allocate(4096 - 64).unwrap();
        let addr = log.allocate(128).unwrap();
        assert_eq!(addr.page(12), 1);
        assert_eq!(addr.offset(12), 0);
    }

    #[test]
    fn frontier_invariant_holds_under_pressure() {
        let (log, epoch) = test_log(12, 13); // 2 pages in memory
        epoch.protect(0);
        let mut wrote = 0u64;
        let mut retries = 0;
        while wrote < 40_000 {
            match log.allocate(512) {
                Ok(_) => wrote += 512,
                Err(Status::RetryLater) => {
                    retries += 1;
                    assert!(retries < 1_000_000, "allocation livelocked");
                    epoch.refresh(0);
                    std::thread::yield_now();
                }
                Err(other) => panic!("unexpected status {other:?}"),
            }
            let stats = log.stats();
            assert!(stats.begin_address <= stats.head_address);
            assert!(stats.head_address <= stats.safe_head_address);
            assert!(stats.safe_head_address <= stats.read_only_address);
            assert!(stats.read_only_address <= stats.safe_read_only_address);
            assert!(stats.safe_read_only_address <= stats.tail_address);
        }
        epoch.unprotect(0);
        assert!(log.head_address() > Address::new(FIRST_LOG_ADDRESS));
    }

    #[test]
    fn oversized_allocation_rejected() {
        let (log, _epoch) = test_log(12, 16);
        assert!(matches!(log.allocate(8192), Err(Status::InvalidArgument)));
    }

    #[test]
    fn read_only_shift_flushes_below_after_drain() {
        let (log, epoch) = test_log(12, 16);
        epoch.protect(0);
        // Fill two pages so pages 0 and 1 are complete.
        for _ in 0..((2 * 4096 - 64) / 64) {
            log.allocate(64).unwrap();
        }
        log.allocate(64).unwrap(); // lands on page 2
        log.shift_read_only(Address::new(2 * 4096));
        // Drain runs the confirmation, which queues the flushes.
        epoch.refresh(0);
        log.wait_for_flush(Address::new(2 * 4096));
        assert_eq!(log.flushed_until_address(), Address::new(2 * 4096));
        assert!(log.read_only_address() >= Address::new(2 * 4096));
        epoch.unprotect(0);
    }

    #[test]
    fn bytes_at_resident_and_absent() {
        let (log, _epoch) = test_log(12, 16);
        let addr = log.allocate(64).unwrap();
        // SAFETY: single-threaded test with the page resident.
        unsafe {
            let (ptr, remaining) = log.bytes_at(addr).unwrap();
            assert!(remaining >= 64);
            *ptr = 0x5A;
            assert_eq!(*log.bytes_at(addr).unwrap().0, 0x5A);
            assert!(log.bytes_at(Address::new(1 << 20)).is_none());
        }
    }
}
