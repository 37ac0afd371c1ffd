//! Pool of overflow buckets.
//!
//! Overflow buckets are allocated as individual boxed cache lines so their
//! addresses stay stable while the pool's index vector grows. Links between
//! buckets store 1-based pool indexes, never raw pointers, which keeps the
//! checkpoint image position-independent.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};

use super::bucket::{HashBucket, OverflowIndex};

pub(crate) struct OverflowPool {
    buckets: RwLock<Vec<*mut HashBucket>>,
    free_list: Mutex<Vec<OverflowIndex>>,
    refill_in_progress: AtomicBool,
}

impl OverflowPool {
    const REFILL_BATCH: usize = 8;

    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
            refill_in_progress: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    /// Resolve an overflow link to a bucket pointer.
    ///
    /// The pointer stays valid until `clear` (which requires `&mut self`).
    #[inline]
    pub fn bucket_ptr(&self, link: OverflowIndex) -> Option<*const HashBucket> {
        if link.is_none() {
            return None;
        }
        let index = link.control() as usize;
        self.buckets
            .read()
            .get(index - 1)
            .copied()
            .map(|p| p as *const HashBucket)
    }

    /// Allocate a zeroed overflow bucket; returns its link and pointer.
    pub fn allocate(&self) -> (OverflowIndex, *const HashBucket) {
        if let Some(link) = self.free_list.lock().pop() {
            if let Some(ptr) = self.bucket_ptr(link) {
                // SAFETY: pool-owned bucket; unlinked, so no concurrent user.
                unsafe { (*ptr).reset() };
                return (link, ptr);
            }
        }

        struct RefillGuard<'a>(&'a AtomicBool);
        impl Drop for RefillGuard<'_> {
            fn drop(&mut self) {
                self.0.store(false, Ordering::Release);
            }
        }

        // One refiller at a time; everyone else waits on the free list.
        loop {
            if self
                .refill_in_progress
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let _guard = RefillGuard(&self.refill_in_progress);

                if let Some(link) = self.free_list.lock().pop() {
                    if let Some(ptr) = self.bucket_ptr(link) {
                        // SAFETY: as above.
                        unsafe { (*ptr).reset() };
                        return (link, ptr);
                    }
                }

                let mut fresh: Vec<*mut HashBucket> = Vec::with_capacity(Self::REFILL_BATCH);
                for _ in 0..Self::REFILL_BATCH {
                    fresh.push(Box::into_raw(Box::new(HashBucket::new())));
                }

                let (first_link, first_ptr, spares) = {
                    let mut buckets = self.buckets.write();
                    let start = buckets.len();
                    let first_ptr = fresh[0] as *const HashBucket;
                    let first_link = OverflowIndex::new((start + 1) as u64);
                    let spares: Vec<OverflowIndex> = (1..fresh.len())
                        .map(|i| OverflowIndex::new((start + i + 1) as u64))
                        .collect();
                    buckets.extend(fresh);
                    (first_link, first_ptr, spares)
                };

                if !spares.is_empty() {
                    self.free_list.lock().extend(spares);
                }
                return (first_link, first_ptr);
            }

            if let Some(link) = self.free_list.lock().pop() {
                if let Some(ptr) = self.bucket_ptr(link) {
                    // SAFETY: as above.
                    unsafe { (*ptr).reset() };
                    return (link, ptr);
                }
            }
            std::thread::yield_now();
        }
    }

    /// Return a bucket that was never linked into a chain (lost install CAS).
    pub fn deallocate(&self, link: OverflowIndex) {
        if link.is_none() {
            return;
        }
        self.free_list.lock().push(link);
    }

    /// Bucket pointers in pool order, for checkpointing.
    pub fn snapshot(&self) -> Vec<*const HashBucket> {
        self.buckets
            .read()
            .iter()
            .map(|&p| p as *const HashBucket)
            .collect()
    }

    /// Ensure the pool holds exactly `count` buckets (recovery).
    pub fn resize_for_recovery(&mut self, count: usize) {
        self.clear();
        let mut buckets = self.buckets.write();
        for _ in 0..count {
            buckets.push(Box::into_raw(Box::new(HashBucket::new())));
        }
    }

    /// Free every bucket. Exclusive access rules out use-after-free.
    pub fn clear(&mut self) {
        self.free_list.get_mut().clear();
        self.refill_in_progress.store(false, Ordering::Relaxed);
        for ptr in self.buckets.get_mut().drain(..) {
            // SAFETY: ptr came from Box::into_raw and is freed exactly once.
            unsafe { drop(Box::from_raw(ptr)) };
        }
    }
}

impl Drop for OverflowPool {
    fn drop(&mut self) {
        self.clear();
    }
}

// SAFETY: bucket contents are atomics; the pointer vector is lock-protected.
unsafe impl Send for OverflowPool {}
unsafe impl Sync for OverflowPool {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_returns_distinct_links() {
        let pool = OverflowPool::new();
        let (a, _) = pool.allocate();
        let (b, _) = pool.allocate();
        assert!(!a.is_none());
        assert!(!b.is_none());
        assert_ne!(a, b);
    }

    #[test]
    fn deallocated_bucket_is_reused() {
        let pool = OverflowPool::new();
        let (a, _) = pool.allocate();
        pool.deallocate(a);
        let (b, ptr) = pool.allocate();
        assert_eq!(a, b);
        // SAFETY: freshly allocated bucket, exclusively ours.
        let bucket = unsafe { &*ptr };
        for entry in &bucket.entries {
            assert!(entry.load(Ordering::Acquire).is_empty());
        }
    }

    #[test]
    fn recovery_resize_allocates_exact_count() {
        let mut pool = OverflowPool::new();
        pool.resize_for_recovery(5);
        assert_eq!(pool.len(), 5);
        assert!(pool.bucket_ptr(OverflowIndex::new(5)).is_some());
        assert!(pool.bucket_ptr(OverflowIndex::new(6)).is_none());
    }
}
