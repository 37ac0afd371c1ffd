//! Epoch-based protection for safe memory reclamation.
//!
//! Session threads enter an epoch before touching shared log or index state
//! and refresh it at operation boundaries. Work that frees or recycles shared
//! memory (page eviction, retiring an old hash table) is registered as a
//! drain action against the current epoch and runs only after every
//! registered thread has observed a newer epoch — at which point no thread
//! can still hold a reference into the reclaimed region.

use std::cell::{RefCell, UnsafeCell};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::thread;

use parking_lot::Mutex;

use crate::status::Status;

/// Cache line size used for padding the per-thread table.
pub const CACHE_LINE_BYTES: usize = 64;

/// Maximum number of concurrently registered threads.
pub const MAX_THREADS: usize = 96;

/// Epoch value meaning "not protected".
pub const UNPROTECTED: u64 = 0;

/// Capacity of the pending drain-action ring.
const DRAIN_LIST_SIZE: usize = 256;

// ============ Thread id allocation ============

static NEXT_THREAD_ID: AtomicUsize = AtomicUsize::new(0);
static FREE_THREAD_IDS: OnceLock<Mutex<Vec<usize>>> = OnceLock::new();

fn free_thread_ids() -> &'static Mutex<Vec<usize>> {
    FREE_THREAD_IDS.get_or_init(|| Mutex::new(Vec::new()))
}

struct ThreadIdGuard {
    id: usize,
}

impl Drop for ThreadIdGuard {
    fn drop(&mut self) {
        free_thread_ids().lock().push(self.id);
    }
}

thread_local! {
    static THREAD_ID: RefCell<Option<ThreadIdGuard>> = const { RefCell::new(None) };
}

/// Return a stable per-thread id in `0..MAX_THREADS`.
///
/// Ids are recycled when threads exit, so long-running processes that churn
/// threads do not exhaust the table.
pub fn thread_id() -> Result<usize, Status> {
    THREAD_ID.with(|slot| {
        let mut slot = slot.borrow_mut();
        if let Some(guard) = slot.as_ref() {
            return Ok(guard.id);
        }

        if let Some(id) = free_thread_ids().lock().pop() {
            *slot = Some(ThreadIdGuard { id });
            return Ok(id);
        }

        match NEXT_THREAD_ID.fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
            (next < MAX_THREADS).then_some(next + 1)
        }) {
            Ok(id) => {
                *slot = Some(ThreadIdGuard { id });
                Ok(id)
            }
            // Another thread may have just exited; re-check the free list.
            Err(_) => match free_thread_ids().lock().pop() {
                Some(id) => {
                    *slot = Some(ThreadIdGuard { id });
                    Ok(id)
                }
                None => Err(Status::TooManyThreads),
            },
        }
    })
}

// ============ Per-thread table ============

#[repr(C, align(64))]
struct Slot {
    local_epoch: AtomicU64,
    reentrant: AtomicU32,
    _padding: [u8; CACHE_LINE_BYTES - 12],
}

impl Slot {
    const fn new() -> Self {
        Self {
            local_epoch: AtomicU64::new(UNPROTECTED),
            reentrant: AtomicU32::new(0),
            _padding: [0; CACHE_LINE_BYTES - 12],
        }
    }
}

// ============ Drain actions ============

type DrainCallback = Box<dyn FnOnce() + Send + 'static>;

struct DrainSlot {
    /// Trigger epoch, or `FREE`/`LOCKED`.
    epoch: AtomicU64,
    callback: UnsafeCell<Option<DrainCallback>>,
}

impl DrainSlot {
    const FREE: u64 = u64::MAX;
    const LOCKED: u64 = u64::MAX - 1;

    const fn new() -> Self {
        Self {
            epoch: AtomicU64::new(Self::FREE),
            callback: UnsafeCell::new(None),
        }
    }

    /// Claim and run the slot's callback if it is still armed for
    /// `trigger_epoch`.
    fn try_pop(&self, trigger_epoch: u64) -> bool {
        if self
            .epoch
            .compare_exchange(
                trigger_epoch,
                Self::LOCKED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        // SAFETY: the LOCKED state gives this thread exclusive access to the
        // callback cell.
        let callback = unsafe { (*self.callback.get()).take() };
        self.epoch.store(Self::FREE, Ordering::Release);
        if let Some(callback) = callback {
            callback();
        }
        true
    }

    /// Arm a free slot with `callback` triggered at `trigger_epoch`.
    fn try_push(&self, trigger_epoch: u64, callback: DrainCallback) -> Result<(), DrainCallback> {
        if self
            .epoch
            .compare_exchange(Self::FREE, Self::LOCKED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(callback);
        }
        // SAFETY: as in try_pop, LOCKED grants exclusive access.
        unsafe { *self.callback.get() = Some(callback) };
        self.epoch.store(trigger_epoch, Ordering::Release);
        Ok(())
    }
}

// SAFETY: the callback cell is only touched while the slot is LOCKED.
unsafe impl Send for DrainSlot {}
unsafe impl Sync for DrainSlot {}

/// The epoch manager.
pub struct EpochManager {
    table: Box<[Slot]>,
    drain_list: Box<[DrainSlot]>,
    drain_count: AtomicU32,
    current_epoch: AtomicU64,
    safe_epoch: AtomicU64,
}

impl EpochManager {
    pub fn new() -> Self {
        Self {
            table: (0..MAX_THREADS).map(|_| Slot::new()).collect(),
            drain_list: (0..DRAIN_LIST_SIZE).map(|_| DrainSlot::new()).collect(),
            drain_count: AtomicU32::new(0),
            current_epoch: AtomicU64::new(1),
            safe_epoch: AtomicU64::new(0),
        }
    }

    /// Current global epoch.
    #[inline]
    pub fn current(&self) -> u64 {
        self.current_epoch.load(Ordering::Acquire)
    }

    /// Enter the current epoch.
    #[inline]
    pub fn protect(&self, thread_id: usize) -> u64 {
        debug_assert!(thread_id < MAX_THREADS);
        let epoch = self.current_epoch.load(Ordering::Acquire);
        self.table[thread_id]
            .local_epoch
            .store(epoch, Ordering::Release);
        epoch
    }

    /// Enter the current epoch and run any drain actions that became safe.
    #[inline]
    pub fn protect_and_drain(&self, thread_id: usize) -> u64 {
        let epoch = self.protect(thread_id);
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(epoch);
        }
        epoch
    }

    /// Re-enter the current epoch at an operation boundary. Identical to
    /// `protect_and_drain`; named for call-site clarity.
    #[inline]
    pub fn refresh(&self, thread_id: usize) -> u64 {
        self.protect_and_drain(thread_id)
    }

    /// Nested protection: only the outermost release actually unprotects.
    pub fn reentrant_protect(&self, thread_id: usize) -> u64 {
        debug_assert!(thread_id < MAX_THREADS);
        let slot = &self.table[thread_id];
        if slot.reentrant.fetch_add(1, Ordering::AcqRel) == 0 {
            let epoch = self.current_epoch.load(Ordering::Acquire);
            slot.local_epoch.store(epoch, Ordering::Release);
            epoch
        } else {
            slot.local_epoch.load(Ordering::Acquire)
        }
    }

    pub fn reentrant_unprotect(&self, thread_id: usize) {
        debug_assert!(thread_id < MAX_THREADS);
        let slot = &self.table[thread_id];
        if slot.reentrant.fetch_sub(1, Ordering::AcqRel) == 1 {
            slot.local_epoch.store(UNPROTECTED, Ordering::Release);
        }
    }

    #[inline]
    pub fn is_protected(&self, thread_id: usize) -> bool {
        debug_assert!(thread_id < MAX_THREADS);
        self.table[thread_id].local_epoch.load(Ordering::Acquire) != UNPROTECTED
    }

    #[inline]
    pub fn unprotect(&self, thread_id: usize) {
        debug_assert!(thread_id < MAX_THREADS);
        self.table[thread_id]
            .local_epoch
            .store(UNPROTECTED, Ordering::Release);
    }

    /// Increment the global epoch.
    pub fn bump(&self) -> u64 {
        let next = self.current_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        if self.drain_count.load(Ordering::Acquire) > 0 {
            self.drain(next);
        }
        next
    }

    /// Increment the global epoch and register `action` to run once the
    /// prior epoch is safe (every thread has observed the new one).
    pub fn bump_with_action<F>(&self, action: F) -> u64
    where
        F: FnOnce() + Send + 'static,
    {
        const MAX_FULL_SCANS: usize = 500;

        let prior_epoch = self.bump() - 1;

        // The common case: the prior epoch is already safe (no thread was
        // protected below the new epoch). Run inline instead of parking the
        // action in the ring.
        if self.compute_safe_epoch() >= prior_epoch {
            action();
            return prior_epoch + 1;
        }

        let mut callback: DrainCallback = Box::new(action);
        let mut index = 0;
        let mut full_scans = 0;
        loop {
            let slot = &self.drain_list[index];
            if slot.epoch.load(Ordering::Acquire) == DrainSlot::FREE {
                match slot.try_push(prior_epoch, callback) {
                    Ok(()) => {
                        self.drain_count.fetch_add(1, Ordering::AcqRel);
                        return prior_epoch + 1;
                    }
                    Err(returned) => callback = returned,
                }
            }

            index = (index + 1) % DRAIN_LIST_SIZE;
            if index == 0 {
                // Make room by running whatever became safe meanwhile.
                self.drain(self.current());
                full_scans += 1;
                if full_scans >= MAX_FULL_SCANS {
                    tracing::warn!("drain ring full; running epoch action inline");
                    self.wait_until_safe(prior_epoch);
                    callback();
                    return prior_epoch + 1;
                }
            }
        }
    }

    /// Recompute the safe epoch: one less than the oldest epoch any
    /// protected thread is still in.
    pub fn compute_safe_epoch(&self) -> u64 {
        let current = self.current_epoch.load(Ordering::Acquire);
        let mut oldest = current;
        for slot in self.table.iter() {
            let epoch = slot.local_epoch.load(Ordering::Acquire);
            if epoch != UNPROTECTED && epoch < oldest {
                oldest = epoch;
            }
        }
        let safe = oldest.saturating_sub(1);
        self.safe_epoch.store(safe, Ordering::Release);
        safe
    }

    #[inline]
    pub fn is_safe(&self, epoch: u64) -> bool {
        epoch <= self.safe_epoch.load(Ordering::Acquire)
    }

    /// Spin until `epoch` is safe to reclaim.
    pub fn wait_until_safe(&self, epoch: u64) {
        while self.compute_safe_epoch() < epoch {
            thread::yield_now();
        }
    }

    fn drain(&self, _next_epoch: u64) {
        let safe = self.compute_safe_epoch();
        for slot in self.drain_list.iter() {
            let trigger = slot.epoch.load(Ordering::Acquire);
            if trigger == DrainSlot::FREE || trigger == DrainSlot::LOCKED || trigger > safe {
                continue;
            }
            if slot.try_pop(trigger) && self.drain_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn protect_and_unprotect() {
        let epoch = EpochManager::new();
        assert!(!epoch.is_protected(0));
        let e = epoch.protect(0);
        assert_eq!(e, 1);
        assert!(epoch.is_protected(0));
        epoch.unprotect(0);
        assert!(!epoch.is_protected(0));
    }

    #[test]
    fn safe_epoch_trails_protected_thread() {
        let epoch = EpochManager::new();
        epoch.protect(0);
        epoch.bump(); // global = 2, thread 0 still at 1
        epoch.bump(); // global = 3
        assert_eq!(epoch.compute_safe_epoch(), 0);

        epoch.protect(0); // thread 0 observes epoch 3
        assert_eq!(epoch.compute_safe_epoch(), 2);
        epoch.unprotect(0);
        assert_eq!(epoch.compute_safe_epoch(), 2);
    }

    #[test]
    fn bump_with_action_runs_after_drain() {
        let epoch = Arc::new(EpochManager::new());
        let fired = Arc::new(AtomicBool::new(false));

        epoch.protect(0);
        let fired2 = fired.clone();
        epoch.bump_with_action(move || fired2.store(true, Ordering::Release));
        // Thread 0 still sits in the old epoch, so the action must wait.
        assert!(!fired.load(Ordering::Acquire));

        epoch.protect_and_drain(0);
        assert!(fired.load(Ordering::Acquire));
    }

    #[test]
    fn bump_with_action_runs_inline_when_already_safe() {
        let epoch = EpochManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        epoch.bump_with_action(move || fired2.store(true, Ordering::Release));
        assert!(fired.load(Ordering::Acquire));
    }

    #[test]
    fn reentrant_protection_nests() {
        let epoch = EpochManager::new();
        epoch.reentrant_protect(3);
        epoch.reentrant_protect(3);
        epoch.reentrant_unprotect(3);
        assert!(epoch.is_protected(3));
        epoch.reentrant_unprotect(3);
        assert!(!epoch.is_protected(3));
    }

    #[test]
    fn thread_ids_are_recycled() {
        for _ in 0..(MAX_THREADS * 2) {
            std::thread::spawn(|| {
                let id = thread_id().unwrap();
                assert!(id < MAX_THREADS);
            })
            .join()
            .unwrap();
        }
    }
}
