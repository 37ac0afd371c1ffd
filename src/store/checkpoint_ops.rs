//! CPR coordination: the per-thread phase barrier, the checkpoint driver,
//! and the index-growth driver.
//!
//! The thread calling `take_*_checkpoint` (or `grow_index`) drives the
//! global phase walk. Sessions acknowledge each phase cooperatively from
//! their operation boundaries (`refresh_session`); the driver advances the
//! global state once every participant acked, doing the phase's actual work
//! (index image, log flush, metadata commit) itself.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::address::Address;
use crate::checkpoint::{
    Action, CheckpointInfo, CheckpointKind, CheckpointToken, CheckpointVariant, CommitPoint,
    CommitPoints, IndexMetadata, LogMetadata, Phase, SystemState,
};
use crate::codec::{StoreKey, StoreValue};
use crate::device::SyncDevice;
use crate::epoch::{thread_id, MAX_THREADS};
use crate::status::Status;
use crate::store::context::SessionState;
use crate::store::functions::StoreFunctions;
use crate::store::kv::TideKv;

/// Terminal state of a finished checkpoint, kept for `complete_checkpoint`.
#[derive(Debug, Clone)]
pub enum CheckpointOutcome {
    Completed { kind: CheckpointKind, version: u32 },
    Failed(String),
}

/// What the coordinator is currently running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CprKind {
    Checkpoint(CheckpointKind),
    Grow,
}

/// State shared between the driver and acknowledging sessions.
///
/// Acks are keyed by `(phase, version)` so a session acknowledging a phase
/// the instant the global word changes — possibly before the driver's next
/// loop iteration — is never lost.
pub(crate) struct ActiveCpr {
    pub kind: CprKind,
    pub token: CheckpointToken,
    pub variant: CheckpointVariant,
    /// Version before the PREPARE → IN_PROGRESS bump.
    pub base_version: u32,

    participants: u128,
    acked: HashMap<(u8, u32), u128>,

    /// The version cut, captured at the IN_PROGRESS barrier.
    pub final_address: Address,
    /// First address the snapshot file covers (snapshot variant).
    pub snapshot_start: Address,
    pub index_meta: Option<IndexMetadata>,
    pub log_meta: Option<LogMetadata>,
    /// WAIT_FLUSH work already performed (the driver loop may revisit).
    pub flush_done: bool,
}

impl ActiveCpr {
    fn new(kind: CprKind, token: CheckpointToken, variant: CheckpointVariant, base: u32) -> Self {
        Self {
            kind,
            token,
            variant,
            base_version: base,
            participants: 0,
            acked: HashMap::new(),
            final_address: Address::INVALID,
            snapshot_start: Address::INVALID,
            index_meta: None,
            log_meta: None,
            flush_done: false,
        }
    }

    fn ack(&mut self, thread_id: usize, state: SystemState) {
        if thread_id >= MAX_THREADS {
            return;
        }
        *self
            .acked
            .entry((state.phase as u8, state.version))
            .or_insert(0) |= 1u128 << thread_id;
    }

    fn barrier_complete(&self, state: SystemState) -> bool {
        let acked = self
            .acked
            .get(&(state.phase as u8, state.version))
            .copied()
            .unwrap_or(0);
        acked & self.participants == self.participants
    }

    fn add_participant(&mut self, thread_id: usize) {
        if thread_id < MAX_THREADS {
            self.participants |= 1u128 << thread_id;
        }
    }

    fn remove_participant(&mut self, thread_id: usize) {
        if thread_id < MAX_THREADS {
            self.participants &= !(1u128 << thread_id);
        }
    }
}

/// Holder for the (at most one) active CPR operation.
#[derive(Default)]
pub(crate) struct CprCoordinator {
    inner: Mutex<Option<ActiveCpr>>,
}

impl CprCoordinator {
    pub fn start(&self, active: ActiveCpr) {
        *self.inner.lock() = Some(active);
    }

    pub fn clear(&self) {
        *self.inner.lock() = None;
    }

    pub fn with_active<R>(&self, f: impl FnOnce(&ActiveCpr) -> R) -> Option<R> {
        self.inner.lock().as_ref().map(f)
    }

    pub fn with_active_mut<R>(&self, f: impl FnOnce(&mut ActiveCpr) -> R) -> Option<R> {
        self.inner.lock().as_mut().map(f)
    }

    pub fn ack(&self, thread_id: usize, state: SystemState) {
        if let Some(active) = self.inner.lock().as_mut() {
            active.ack(thread_id, state);
        }
    }

    pub fn add_participant(&self, thread_id: usize) {
        if let Some(active) = self.inner.lock().as_mut() {
            active.add_participant(thread_id);
        }
    }

    pub fn remove_participant(&self, thread_id: usize) {
        if let Some(active) = self.inner.lock().as_mut() {
            active.remove_participant(thread_id);
        }
    }
}

impl<K, V, F, D> TideKv<K, V, F, D>
where
    K: StoreKey,
    V: StoreValue,
    F: StoreFunctions<K, V>,
    D: SyncDevice,
{
    // ===== Session-side phase handling =====

    /// Advance this session through any CPR/growth phase change it has not
    /// yet observed. Called at every operation boundary.
    pub(crate) fn refresh_session(&self, session: &Arc<SessionState<K, F::Input>>) {
        let state = self.state.load(Ordering::Acquire);
        let mut ctx = session.ctx.lock();
        if ctx.observed == state {
            return;
        }

        match state.phase {
            Phase::Rest => {
                ctx.version = state.version;
                ctx.observed = state;
            }
            Phase::InProgress => {
                // The version bump: snapshot the commit point. Operations
                // pending at the bump will complete with post-cut records,
                // so their serials are excluded from this checkpoint
                // (recovery resurfaces them through the commit point). In
                // strict mode they also move to the previous context, which
                // WAIT_PENDING drains before the checkpoint proceeds.
                if ctx.version < state.version {
                    ctx.commit_serial = ctx.serial;
                    ctx.excluded = ctx.io_pending.values().map(|op| op.serial).collect();
                    if !self.relaxed_cpr {
                        let pending = std::mem::take(&mut ctx.io_pending);
                        ctx.prev_io_pending.extend(pending);
                    }
                    ctx.version = state.version;
                }
                ctx.observed = state;
                drop(ctx);
                self.cpr.ack(session.thread_id, state);
            }
            Phase::WaitPending => {
                // Acked only once the previous context drained (relaxed
                // mode never parks anything there).
                if ctx.prev_io_pending.is_empty() && ctx.retries.is_empty() {
                    ctx.observed = state;
                    drop(ctx);
                    self.cpr.ack(session.thread_id, state);
                }
            }
            Phase::Invalid => {}
            _ => {
                ctx.observed = state;
                drop(ctx);
                self.cpr.ack(session.thread_id, state);
            }
        }
    }

    /// Drive the CPR transitions of every session registered to the calling
    /// thread (the driver services its own sessions so a single-threaded
    /// caller can complete barriers).
    fn refresh_own_sessions(&self, tid: usize) {
        let own: Vec<Arc<SessionState<K, F::Input>>> = self
            .sessions
            .lock()
            .values()
            .filter(|s| s.thread_id == tid)
            .cloned()
            .collect();
        for session in own {
            self.refresh_session(&session);
            self.pump_session(&session, tid);
        }
    }

    // ===== Checkpoint API =====

    /// Full checkpoint: index image plus hybrid-log cut under one token.
    pub fn take_full_checkpoint(&self) -> io::Result<CheckpointToken> {
        self.drive_checkpoint(CheckpointKind::Full)
    }

    /// Index-only checkpoint.
    pub fn take_index_checkpoint(&self) -> io::Result<CheckpointToken> {
        self.drive_checkpoint(CheckpointKind::IndexOnly)
    }

    /// Hybrid-log-only checkpoint.
    pub fn take_hybrid_log_checkpoint(&self) -> io::Result<CheckpointToken> {
        self.drive_checkpoint(CheckpointKind::HybridLogOnly)
    }

    /// Observe a checkpoint's terminal state. With `wait`, blocks until the
    /// token completes (it must be driven by another thread).
    pub fn complete_checkpoint(&self, token: CheckpointToken, wait: bool) -> Status {
        loop {
            if let Some(outcome) = self.checkpoint_outcomes.lock().get(&token) {
                return match outcome {
                    CheckpointOutcome::Completed { .. } => Status::Ok,
                    CheckpointOutcome::Failed(_) => Status::IoError,
                };
            }
            if !wait {
                return Status::Pending;
            }
            std::thread::yield_now();
        }
    }

    fn drive_checkpoint(&self, kind: CheckpointKind) -> io::Result<CheckpointToken> {
        let manager = self
            .checkpoint_manager
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no checkpoint backend"))?;

        let action = match kind {
            CheckpointKind::Full => Action::CheckpointFull,
            CheckpointKind::IndexOnly => Action::CheckpointIndex,
            CheckpointKind::HybridLogOnly => Action::CheckpointHybridLog,
        };
        let start = self.state.try_start(action).map_err(|current| {
            io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("another operation is running: {:?}", current),
            )
        })?;
        let base_version = start.version;

        let token = Uuid::new_v4();
        let driver_tid = thread_id().map_err(|s| io::Error::other(s.to_string()))?;
        self.epoch.reentrant_protect(driver_tid);

        let mut active = ActiveCpr::new(
            CprKind::Checkpoint(kind),
            token,
            self.checkpoint_variant,
            base_version,
        );
        active.add_participant(driver_tid);
        for session in self.sessions.lock().values() {
            active.add_participant(session.thread_id);
        }
        self.cpr.start(active);

        tracing::info!(%token, ?kind, version = base_version, "checkpoint start");
        let result = manager
            .create(token)
            .and_then(|()| self.run_checkpoint_phases(&*manager, token, kind, driver_tid));

        self.cpr.clear();
        self.epoch.reentrant_unprotect(driver_tid);

        match result {
            Ok(version) => {
                tracing::info!(%token, ?kind, version, "checkpoint complete");
                self.checkpoint_outcomes
                    .lock()
                    .insert(token, CheckpointOutcome::Completed { kind, version });
                Ok(token)
            }
            Err(error) => {
                tracing::warn!(%token, ?kind, %error, "checkpoint failed");
                // Roll the state machine back to rest at the pre-bump
                // version so operation can continue.
                self.state
                    .store(SystemState::rest(base_version), Ordering::Release);
                self.checkpoint_outcomes
                    .lock()
                    .insert(token, CheckpointOutcome::Failed(error.to_string()));
                Err(error)
            }
        }
    }

    fn run_checkpoint_phases(
        &self,
        manager: &dyn crate::checkpoint::CheckpointManager,
        token: CheckpointToken,
        kind: CheckpointKind,
        driver_tid: usize,
    ) -> io::Result<u32> {
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state.phase == Phase::Rest {
                return Ok(state.version);
            }

            self.epoch.refresh(driver_tid);
            self.refresh_own_sessions(driver_tid);
            // The driver itself is always at an operation boundary.
            self.cpr.ack(driver_tid, state);

            match state.phase {
                Phase::PrepIndexCheckpoint | Phase::Prepare => {
                    if self.barrier_complete(state) {
                        let _ = self.state.try_advance();
                    }
                }

                Phase::IndexCheckpoint => {
                    // Driver-only work: capture the replay start, then dump
                    // the bucket array.
                    let start_address = self.hlog.tail_address();
                    let mut sink = manager.index_sink(token)?;
                    // Cache entries resolve to the main-log addresses their
                    // records shadow; the cache itself is volatile.
                    let resolve = |address: crate::address::Address| match &self.cache {
                        Some(cache) => cache.skip(address),
                        None => crate::address::Address::INVALID,
                    };
                    let (table_size, overflow_buckets, num_entries) =
                        self.index().write_snapshot(&mut sink, &resolve)?;
                    io::Write::flush(&mut sink)?;
                    let meta = IndexMetadata {
                        token,
                        version: state.version,
                        table_size,
                        overflow_buckets,
                        num_entries,
                        begin_address: self.hlog.begin_address().control(),
                        checkpoint_start_address: start_address.control(),
                    };
                    self.cpr.with_active_mut(|active| active.index_meta = Some(meta));
                    if kind == CheckpointKind::IndexOnly {
                        // The index-only walk ends here; commit now.
                        self.persist_commit_record(manager, token, kind, state.version)?;
                    }
                    let _ = self.state.try_advance();
                }

                Phase::InProgress => {
                    if self.barrier_complete(state) {
                        // Every session is now in the new version: the tail
                        // is a valid cut for the old one.
                        let cut = self.hlog.tail_address();
                        let snapshot_start = self.hlog.flushed_until_address();
                        self.cpr.with_active_mut(|active| {
                            active.final_address = cut;
                            active.snapshot_start = snapshot_start;
                        });
                        let _ = self.state.try_advance();
                    }
                }

                Phase::WaitPending => {
                    if self.barrier_complete(state) {
                        let _ = self.state.try_advance();
                    }
                }

                Phase::WaitFlush => {
                    let done = self
                        .cpr
                        .with_active(|active| active.flush_done)
                        .unwrap_or(true);
                    if !done {
                        self.drive_wait_flush(manager, token, state.version)?;
                    }
                    if self.barrier_complete(state) {
                        let _ = self.state.try_advance();
                    }
                }

                Phase::PersistenceCallback => {
                    self.persist_commit_record(manager, token, kind, state.version)?;
                    let _ = self.state.try_advance();
                }

                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unexpected phase {:?} during checkpoint", state.phase),
                    ));
                }
            }

            std::thread::yield_now();
        }
    }

    fn barrier_complete(&self, state: SystemState) -> bool {
        self.cpr
            .with_active(|active| active.barrier_complete(state))
            .unwrap_or(false)
    }

    /// WAIT_FLUSH: make everything below the cut durable.
    fn drive_wait_flush(
        &self,
        manager: &dyn crate::checkpoint::CheckpointManager,
        token: CheckpointToken,
        version: u32,
    ) -> io::Result<()> {
        let (variant, cut, snapshot_start) = self
            .cpr
            .with_active(|active| (active.variant, active.final_address, active.snapshot_start))
            .ok_or_else(|| io::Error::other("no active checkpoint"))?;

        match variant {
            CheckpointVariant::FoldOver => {
                // The cut becomes append-only; wait for every thread to see
                // that before flushing, otherwise an in-place update could
                // chase the flush.
                self.hlog.shift_read_only(cut);
                let tid = thread_id().map_err(|s| io::Error::other(s.to_string()))?;
                while self.hlog.read_only_address() < cut {
                    self.epoch.refresh(tid);
                    self.refresh_own_sessions(tid);
                    std::thread::yield_now();
                }
                self.hlog.flush_until(cut)?;
            }
            CheckpointVariant::Snapshot => {
                // Stream the unflushed suffix into the snapshot file; the
                // live log is left alone.
                let mut sink = manager.snapshot_sink(token)?;
                let mut cursor = snapshot_start;
                let chunk = self.hlog.config().page_size();
                let mut buf = Vec::with_capacity(chunk as usize);
                while cursor < cut {
                    let end = cut.min(cursor + chunk);
                    buf.clear();
                    self.hlog
                        .copy_range(cursor, end, &mut buf)
                        .map_err(|status| io::Error::other(status.to_string()))?;
                    io::Write::write_all(&mut sink, &buf)?;
                    cursor = end;
                }
                io::Write::flush(&mut sink)?;
            }
        }

        let log_meta = LogMetadata {
            token,
            version,
            variant,
            begin_address: self.hlog.begin_address().control(),
            final_address: cut.control(),
            flushed_until_address: self.hlog.flushed_until_address().control(),
            snapshot_start_address: if variant == CheckpointVariant::Snapshot {
                snapshot_start.control()
            } else {
                0
            },
        };
        self.cpr.with_active_mut(|active| {
            active.log_meta = Some(log_meta);
            active.flush_done = true;
        });
        Ok(())
    }

    /// PERSISTENCE_CALLBACK: record commit points and commit `info.dat`.
    fn persist_commit_record(
        &self,
        manager: &dyn crate::checkpoint::CheckpointManager,
        token: CheckpointToken,
        kind: CheckpointKind,
        version: u32,
    ) -> io::Result<()> {
        let mut points = CommitPoints::default();
        let mut completions: Vec<(Uuid, u64)> = Vec::new();
        for session in self.sessions.lock().values() {
            let ctx = session.ctx.lock();
            points.points.push(CommitPoint {
                guid: session.guid,
                serial: ctx.commit_serial,
                excluded_serials: ctx.excluded.clone(),
            });
            completions.push((session.guid, ctx.commit_serial));
        }
        manager.commit_points(token, &points.to_json()?)?;

        let (index_meta, log_meta) = self
            .cpr
            .with_active(|active| (active.index_meta.clone(), active.log_meta.clone()))
            .unwrap_or((None, None));

        let info = CheckpointInfo {
            token,
            kind,
            sequence: self.checkpoint_sequence.fetch_add(1, Ordering::AcqRel) + 1,
            index: index_meta,
            log: log_meta,
        };
        manager.commit_info(token, &info.to_json()?)?;

        for (guid, serial) in completions {
            self.functions.checkpoint_completed(guid, serial);
        }
        Ok(())
    }

    // ===== Index growth =====

    /// Double the hash table, migrating entries while operations continue.
    pub fn grow_index(&self) -> Result<u64, Status> {
        self.state
            .try_start(Action::GrowIndex)
            .map_err(|_| Status::Aborted)?;

        let driver_tid = thread_id()?;
        self.epoch.reentrant_protect(driver_tid);

        let mut active = ActiveCpr::new(
            CprKind::Grow,
            Uuid::nil(),
            self.checkpoint_variant,
            self.state.version(),
        );
        active.add_participant(driver_tid);
        for session in self.sessions.lock().values() {
            active.add_participant(session.thread_id);
        }
        self.cpr.start(active);

        let base_version = self.state.version();
        let result = self.run_grow_phases(driver_tid);

        self.cpr.clear();
        self.epoch.reentrant_unprotect(driver_tid);
        if result.is_err() {
            self.state
                .store(SystemState::rest(base_version), Ordering::Release);
        }
        result
    }

    fn run_grow_phases(&self, driver_tid: usize) -> Result<u64, Status> {
        let new_size = self.index().size() * 2;
        loop {
            let state = self.state.load(Ordering::Acquire);
            if state.phase == Phase::Rest {
                return Ok(self.index().size());
            }

            self.epoch.refresh(driver_tid);
            self.refresh_own_sessions(driver_tid);
            self.cpr.ack(driver_tid, state);

            match state.phase {
                Phase::GrowPrepare => {
                    if self.barrier_complete(state) {
                        let _ = self.state.try_advance();
                    }
                }
                Phase::GrowInProgress => {
                    tracing::info!(
                        old_size = self.index().size(),
                        new_size,
                        "index growth started"
                    );
                    // SAFETY: single driver under the state machine; only
                    // the inactive table is touched structurally.
                    unsafe { self.index_mut() }.start_grow(new_size)?;
                    let chunks = self.index().grow_chunks();
                    let rehash = |address: Address| self.key_hash_at(address);
                    for chunk in 0..chunks {
                        self.index().migrate_chunk(chunk, &rehash);
                        self.epoch.refresh(driver_tid);
                        self.refresh_own_sessions(driver_tid);
                    }
                    // No thread may still be walking the old table once it
                    // can be re-initialised by a later growth.
                    let outcome = self.index().finish_grow();
                    self.epoch.bump();
                    tracing::info!(
                        entries_migrated = outcome.entries_migrated,
                        "index growth finished"
                    );
                    let _ = self.state.try_advance();
                }
                _ => return Err(Status::InvalidOperation),
            }

            std::thread::yield_now();
        }
    }
}
