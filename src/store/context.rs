//! Per-session execution state.
//!
//! A session's mutable state lives behind a mutex in an `Arc` shared with
//! the store's registry, so the checkpoint driver can walk every session's
//! CPR transitions even when the owning thread is merely between
//! operations.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::Address;
use crate::checkpoint::SystemState;
use crate::status::OpKind;

/// A parked operation frame: a read or RMW waiting on a disk record, or an
/// operation bounced with a transient status.
#[derive(Debug)]
pub(crate) struct PendingOp<K, I> {
    /// Session-local monotonic id.
    pub id: u64,
    pub serial: u64,
    pub kind: OpKind,
    pub key: K,
    pub input: I,
    /// Log address the outstanding I/O targets.
    pub address: Address,
    /// Session version when the operation was issued.
    pub version: u32,
}

/// The session execution context.
pub(crate) struct SessionCtx<K, I> {
    /// Session version (trails or equals the global version).
    pub version: u32,
    /// Last global state this session acknowledged.
    pub observed: SystemState,
    /// Highest serial number returned to the caller.
    pub serial: u64,
    /// Serial at the last version bump (the CPR commit point).
    pub commit_serial: u64,
    /// Serials excluded from the running checkpoint (relaxed CPR).
    pub excluded: Vec<u64>,
    pub next_pending_id: u64,
    /// Operations with outstanding device reads, by pending id.
    pub io_pending: HashMap<u64, PendingOp<K, I>>,
    /// Pre-version-bump pendings that must drain before WAIT_PENDING acks.
    pub prev_io_pending: HashMap<u64, PendingOp<K, I>>,
    /// Completed I/Os whose operations must be re-issued.
    pub retries: VecDeque<(PendingOp<K, I>, RetryPayload)>,
}

/// What a completed I/O carried back for the retry step.
#[derive(Debug)]
pub(crate) enum RetryPayload {
    /// The record bytes fetched from the device.
    Record(Vec<u8>),
    /// The device failed; surface through the completion callback.
    IoError,
}

impl<K, I> SessionCtx<K, I> {
    fn new(version: u32) -> Self {
        Self {
            version,
            observed: SystemState::rest(version),
            serial: 0,
            commit_serial: 0,
            excluded: Vec::new(),
            next_pending_id: 0,
            io_pending: HashMap::new(),
            prev_io_pending: HashMap::new(),
            retries: VecDeque::new(),
        }
    }

    pub fn allocate_pending_id(&mut self) -> u64 {
        let id = self.next_pending_id;
        self.next_pending_id += 1;
        id
    }

    /// Serial numbers of outstanding work, current and previous version.
    pub fn pending_serials(&self) -> Vec<u64> {
        let mut serials: Vec<u64> = self
            .io_pending
            .values()
            .chain(self.prev_io_pending.values())
            .map(|op| op.serial)
            .chain(self.retries.iter().map(|(op, _)| op.serial))
            .collect();
        serials.sort_unstable();
        serials.dedup();
        serials
    }

    pub fn has_outstanding(&self) -> bool {
        !self.io_pending.is_empty() || !self.prev_io_pending.is_empty() || !self.retries.is_empty()
    }

    /// Remove a pending frame from whichever version map holds it.
    pub fn take_pending(&mut self, id: u64) -> Option<PendingOp<K, I>> {
        self.io_pending
            .remove(&id)
            .or_else(|| self.prev_io_pending.remove(&id))
    }

    /// Park a frame again (chain walk continues on disk, or a short probe
    /// is being reissued). Frames from before the version bump go back to
    /// the previous context so WAIT_PENDING keeps waiting for them.
    pub fn reinsert_pending(&mut self, op: PendingOp<K, I>) {
        if op.version < self.version {
            self.prev_io_pending.insert(op.id, op);
        } else {
            self.io_pending.insert(op.id, op);
        }
    }
}

/// Shared session record: identity plus the locked context.
pub(crate) struct SessionState<K, I> {
    pub guid: Uuid,
    /// Epoch-table thread id of the owning thread.
    pub thread_id: usize,
    pub ctx: Mutex<SessionCtx<K, I>>,
}

impl<K, I> SessionState<K, I> {
    pub fn new(guid: Uuid, thread_id: usize, version: u32) -> Self {
        Self {
            guid,
            thread_id,
            ctx: Mutex::new(SessionCtx::new(version)),
        }
    }

    /// Continue a recovered session from its commit point.
    pub fn continued(guid: Uuid, thread_id: usize, version: u32, serial: u64) -> Self {
        let state = Self::new(guid, thread_id, version);
        {
            let mut ctx = state.ctx.lock();
            ctx.serial = serial;
            ctx.commit_serial = serial;
        }
        state
    }
}
