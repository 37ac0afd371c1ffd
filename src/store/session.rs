//! Session handles: the per-thread façade over the store engine.
//!
//! A session pins its thread into the epoch for its whole lifetime and
//! carries the CPR execution context. Sessions are not `Sync`; one session
//! per thread is the intended shape. Every operation takes a caller-chosen,
//! strictly increasing serial number — the currency of the recovery
//! guarantee.

use std::sync::Arc;

use uuid::Uuid;

use crate::checkpoint::CommitPoint;
use crate::codec::{StoreKey, StoreValue};
use crate::device::SyncDevice;
use crate::epoch::thread_id;
use crate::status::{OpKind, OpStatus, Status};
use crate::store::context::SessionState;
use crate::store::functions::StoreFunctions;
use crate::store::kv::{ReadMiss, RmwMiss, TideKv};

/// A session over a [`TideKv`] store.
pub struct Session<K, V, F, D>
where
    K: StoreKey,
    V: StoreValue,
    F: StoreFunctions<K, V>,
    D: SyncDevice,
{
    store: Arc<TideKv<K, V, F, D>>,
    state: Arc<SessionState<K, F::Input>>,
}

impl<K, V, F, D> TideKv<K, V, F, D>
where
    K: StoreKey,
    V: StoreValue,
    F: StoreFunctions<K, V>,
    D: SyncDevice,
{
    /// Open a new session on the calling thread.
    pub fn start_session(self: &Arc<Self>) -> Result<Session<K, V, F, D>, Status> {
        let tid = thread_id()?;
        self.epoch.reentrant_protect(tid);
        let guid = Uuid::new_v4();
        let state = Arc::new(SessionState::new(guid, tid, self.state.version()));
        self.sessions.lock().insert(guid, state.clone());
        self.cpr.add_participant(tid);
        Ok(Session {
            store: self.clone(),
            state,
        })
    }

    /// Resume a recovered session; returns its handle and commit point.
    pub fn continue_session(
        self: &Arc<Self>,
        guid: Uuid,
    ) -> Result<(Session<K, V, F, D>, CommitPoint), Status> {
        let point = self
            .recovered_sessions
            .lock()
            .get(&guid)
            .cloned()
            .ok_or(Status::NotFound)?;
        let tid = thread_id()?;
        self.epoch.reentrant_protect(tid);
        let state = Arc::new(SessionState::continued(
            guid,
            tid,
            self.state.version(),
            point.serial,
        ));
        self.sessions.lock().insert(guid, state.clone());
        self.cpr.add_participant(tid);
        Ok((
            Session {
                store: self.clone(),
                state,
            },
            point,
        ))
    }

    fn stop_session(&self, state: &Arc<SessionState<K, F::Input>>) {
        self.sessions.lock().remove(&state.guid);
        let thread_still_used = self
            .sessions
            .lock()
            .values()
            .any(|s| s.thread_id == state.thread_id);
        if !thread_still_used {
            self.cpr.remove_participant(state.thread_id);
        }
        self.epoch.reentrant_unprotect(state.thread_id);
    }
}

impl<K, V, F, D> Session<K, V, F, D>
where
    K: StoreKey,
    V: StoreValue,
    F: StoreFunctions<K, V>,
    D: SyncDevice,
{
    pub fn guid(&self) -> Uuid {
        self.state.guid
    }

    /// Highest serial number recorded so far.
    pub fn serial(&self) -> u64 {
        self.state.ctx.lock().serial
    }

    fn preamble(&self) {
        self.store.epoch.refresh(self.state.thread_id);
        self.store.refresh_session(&self.state);
    }

    fn record_serial(&self, serial: u64) {
        let mut ctx = self.state.ctx.lock();
        debug_assert!(serial > ctx.serial || ctx.serial == 0);
        ctx.serial = serial.max(ctx.serial);
    }

    /// Read `key`. `Pending` means the record is on disk; the result is
    /// delivered through `F::read_completed` during `complete_pending`.
    pub fn read(&mut self, key: &K, input: &F::Input, serial: u64) -> (Status, Option<F::Output>) {
        self.preamble();
        loop {
            match self.store.try_read(key, input) {
                Ok(output) => {
                    self.record_serial(serial);
                    return (Status::Ok, Some(output));
                }
                Err(ReadMiss::NotFound) => {
                    self.record_serial(serial);
                    return (Status::NotFound, None);
                }
                Err(ReadMiss::Retry) => continue,
                Err(ReadMiss::OnDisk(address)) => {
                    self.record_serial(serial);
                    self.store.enqueue_pending(
                        &self.state,
                        OpKind::Read,
                        key,
                        input.clone(),
                        address,
                        serial,
                    );
                    return (Status::Pending, None);
                }
            }
        }
    }

    /// Blind write of `key → value`.
    pub fn upsert(&mut self, key: &K, value: &V, serial: u64) -> Status {
        self.preamble();
        loop {
            let (version, in_new_version) = self.store.session_write_stamp(&self.state);
            match self.store.try_upsert(key, value, version, in_new_version) {
                Ok(()) => {
                    self.record_serial(serial);
                    return Status::Ok;
                }
                Err(OpStatus::RetryNow) => continue,
                Err(OpStatus::CprShiftDetected) => {
                    self.store.refresh_session(&self.state);
                }
                Err(_) => self.back_off(),
            }
        }
    }

    /// Read-modify-write of `key` with `input`.
    pub fn rmw(&mut self, key: &K, input: &F::Input, serial: u64) -> Status {
        self.preamble();
        loop {
            let (version, in_new_version) = self.store.session_write_stamp(&self.state);
            match self.store.try_rmw(key, input, version, in_new_version) {
                Ok(()) => {
                    self.record_serial(serial);
                    return Status::Ok;
                }
                Err(RmwMiss::Op(OpStatus::RetryNow)) => continue,
                Err(RmwMiss::Op(OpStatus::CprShiftDetected)) => {
                    self.store.refresh_session(&self.state);
                }
                Err(RmwMiss::Op(_)) => self.back_off(),
                Err(RmwMiss::OnDisk(address)) => {
                    self.record_serial(serial);
                    self.store.enqueue_pending(
                        &self.state,
                        OpKind::Rmw,
                        key,
                        input.clone(),
                        address,
                        serial,
                    );
                    return Status::Pending;
                }
            }
        }
    }

    /// Delete `key` (tombstone append; best-effort entry elision).
    pub fn delete(&mut self, key: &K, serial: u64) -> Status {
        self.preamble();
        loop {
            let (version, in_new_version) = self.store.session_write_stamp(&self.state);
            match self.store.try_delete(key, version, in_new_version) {
                Ok(true) => {
                    self.record_serial(serial);
                    return Status::Ok;
                }
                Ok(false) => {
                    self.record_serial(serial);
                    return Status::NotFound;
                }
                Err(OpStatus::RetryNow) => continue,
                Err(OpStatus::CprShiftDetected) => {
                    self.store.refresh_session(&self.state);
                }
                Err(_) => self.back_off(),
            }
        }
    }

    fn back_off(&self) {
        self.store.epoch.refresh(self.state.thread_id);
        self.store.refresh_session(&self.state);
        std::thread::yield_now();
    }

    /// Re-enter the current epoch and observe any phase change.
    pub fn refresh(&mut self) {
        self.preamble();
    }

    /// Drain I/O completions and reissue retries. With `wait`, loops until
    /// nothing is outstanding. Returns whether the session is drained.
    pub fn complete_pending(&mut self, wait: bool) -> bool {
        loop {
            self.preamble();
            self.store.pump_session(&self.state, self.state.thread_id);
            if !self.state.ctx.lock().has_outstanding() {
                return true;
            }
            if !wait {
                return false;
            }
            std::thread::yield_now();
        }
    }

    /// Serial numbers of outstanding operations (current and previous
    /// version contexts).
    pub fn get_pending_requests(&self) -> Vec<u64> {
        self.state.ctx.lock().pending_serials()
    }

    /// End the session. Outstanding pendings are dropped; their serials
    /// stay visible to checkpoints through the commit-point exclusions.
    pub fn stop(self) {
        drop(self);
    }
}

impl<K, V, F, D> Drop for Session<K, V, F, D>
where
    K: StoreKey,
    V: StoreValue,
    F: StoreFunctions<K, V>,
    D: SyncDevice,
{
    fn drop(&mut self) {
        self.store.stop_session(&self.state);
    }
}
