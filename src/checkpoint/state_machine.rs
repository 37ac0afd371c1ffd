//! The global action/phase/version word driving checkpoints and index
//! growth.
//!
//! The store owns one `AtomicSystemState`. An operation (checkpoint, grow)
//! starts by CAS-ing out of REST into its first phase; sessions observe the
//! word cooperatively at operation boundaries and acknowledge each phase;
//! the driver advances to the next phase once every participant acked.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::status::Status;

/// Global operations; at most one runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Action {
    #[default]
    None = 0,
    CheckpointFull = 1,
    CheckpointIndex = 2,
    CheckpointHybridLog = 3,
    Recover = 4,
    GrowIndex = 5,
}

impl From<u8> for Action {
    fn from(v: u8) -> Self {
        match v {
            1 => Action::CheckpointFull,
            2 => Action::CheckpointIndex,
            3 => Action::CheckpointHybridLog,
            4 => Action::Recover,
            5 => Action::GrowIndex,
            _ => Action::None,
        }
    }
}

/// Phases the global state walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Phase {
    #[default]
    Rest = 0,
    PrepIndexCheckpoint = 1,
    IndexCheckpoint = 2,
    Prepare = 3,
    InProgress = 4,
    WaitPending = 5,
    WaitFlush = 6,
    PersistenceCallback = 7,
    GrowPrepare = 8,
    GrowInProgress = 9,
    Invalid = 255,
}

impl From<u8> for Phase {
    fn from(v: u8) -> Self {
        match v {
            0 => Phase::Rest,
            1 => Phase::PrepIndexCheckpoint,
            2 => Phase::IndexCheckpoint,
            3 => Phase::Prepare,
            4 => Phase::InProgress,
            5 => Phase::WaitPending,
            6 => Phase::WaitFlush,
            7 => Phase::PersistenceCallback,
            8 => Phase::GrowPrepare,
            9 => Phase::GrowInProgress,
            _ => Phase::Invalid,
        }
    }
}

/// `{ action, phase, version }` packed into one atomic word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemState {
    pub action: Action,
    pub phase: Phase,
    pub version: u32,
}

impl SystemState {
    pub const fn new(action: Action, phase: Phase, version: u32) -> Self {
        Self {
            action,
            phase,
            version,
        }
    }

    pub const fn rest(version: u32) -> Self {
        Self::new(Action::None, Phase::Rest, version)
    }

    #[inline]
    pub fn to_control(self) -> u64 {
        (self.action as u64) | ((self.phase as u64) << 8) | ((self.version as u64) << 16)
    }

    #[inline]
    pub fn from_control(control: u64) -> Self {
        Self {
            action: Action::from((control & 0xFF) as u8),
            phase: Phase::from(((control >> 8) & 0xFF) as u8),
            version: ((control >> 16) & 0xFFFF_FFFF) as u32,
        }
    }

    #[inline]
    pub fn is_rest(&self) -> bool {
        self.phase == Phase::Rest
    }

    /// The successor state in this action's walk. The version bumps on the
    /// PREPARE → IN_PROGRESS edge.
    pub fn next(&self) -> Result<SystemState, Status> {
        use Action::*;
        use Phase::*;

        let step = |phase: Phase, version: u32| Ok(SystemState::new(self.action, phase, version));

        match self.action {
            None | Recover => Err(Status::InvalidOperation),

            CheckpointFull => match self.phase {
                Rest => step(PrepIndexCheckpoint, self.version),
                PrepIndexCheckpoint => step(IndexCheckpoint, self.version),
                IndexCheckpoint => step(Prepare, self.version),
                Prepare => step(InProgress, self.version + 1),
                InProgress => step(WaitPending, self.version),
                WaitPending => step(WaitFlush, self.version),
                WaitFlush => step(PersistenceCallback, self.version),
                PersistenceCallback => Ok(SystemState::rest(self.version)),
                _ => Err(Status::InvalidOperation),
            },

            CheckpointIndex => match self.phase {
                Rest => step(PrepIndexCheckpoint, self.version),
                PrepIndexCheckpoint => step(IndexCheckpoint, self.version),
                IndexCheckpoint => Ok(SystemState::rest(self.version)),
                _ => Err(Status::InvalidOperation),
            },

            CheckpointHybridLog => match self.phase {
                Rest => step(Prepare, self.version),
                Prepare => step(InProgress, self.version + 1),
                InProgress => step(WaitPending, self.version),
                WaitPending => step(WaitFlush, self.version),
                WaitFlush => step(PersistenceCallback, self.version),
                PersistenceCallback => Ok(SystemState::rest(self.version)),
                _ => Err(Status::InvalidOperation),
            },

            GrowIndex => match self.phase {
                Rest => step(GrowPrepare, self.version),
                GrowPrepare => step(GrowInProgress, self.version),
                GrowInProgress => Ok(SystemState::rest(self.version)),
                _ => Err(Status::InvalidOperation),
            },
        }
    }
}

impl Default for SystemState {
    fn default() -> Self {
        // Version 1: a record's 13-bit version field of zero then always
        // means "pre-history", which recovery can skip unconditionally.
        Self::rest(1)
    }
}

/// Atomically published system state.
#[derive(Debug)]
pub struct AtomicSystemState {
    control: AtomicU64,
}

impl AtomicSystemState {
    pub fn new(state: SystemState) -> Self {
        Self {
            control: AtomicU64::new(state.to_control()),
        }
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> SystemState {
        SystemState::from_control(self.control.load(ordering))
    }

    #[inline]
    pub fn store(&self, state: SystemState, ordering: Ordering) {
        self.control.store(state.to_control(), ordering);
    }

    #[inline]
    pub fn version(&self) -> u32 {
        self.load(Ordering::Acquire).version
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.load(Ordering::Acquire).phase
    }

    pub fn compare_exchange(
        &self,
        expected: SystemState,
        desired: SystemState,
    ) -> Result<SystemState, SystemState> {
        self.control
            .compare_exchange(
                expected.to_control(),
                desired.to_control(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(SystemState::from_control)
            .map_err(SystemState::from_control)
    }

    /// Begin `action` from REST: CAS into its first phase.
    pub fn try_start(&self, action: Action) -> Result<SystemState, SystemState> {
        let current = self.load(Ordering::Acquire);
        if !current.is_rest() {
            return Err(current);
        }
        let seed = SystemState::new(action, Phase::Rest, current.version);
        let first = seed.next().map_err(|_| current)?;
        self.compare_exchange(current, first)
    }

    /// Advance the current action to its next phase.
    pub fn try_advance(&self) -> Result<SystemState, SystemState> {
        let current = self.load(Ordering::Acquire);
        let next = match current.next() {
            Ok(next) => next,
            Err(_) => return Err(current),
        };
        self.compare_exchange(current, next).map(|_| next)
    }
}

impl Default for AtomicSystemState {
    fn default() -> Self {
        Self::new(SystemState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_roundtrip() {
        let state = SystemState::new(Action::CheckpointFull, Phase::WaitFlush, 77);
        assert_eq!(SystemState::from_control(state.to_control()), state);
    }

    #[test]
    fn full_checkpoint_walk() {
        let mut state = SystemState::new(Action::CheckpointFull, Phase::Rest, 1);
        let expected = [
            Phase::PrepIndexCheckpoint,
            Phase::IndexCheckpoint,
            Phase::Prepare,
            Phase::InProgress,
            Phase::WaitPending,
            Phase::WaitFlush,
            Phase::PersistenceCallback,
            Phase::Rest,
        ];
        for phase in expected {
            state = state.next().unwrap();
            assert_eq!(state.phase, phase);
        }
        // The version bumped exactly once, at PREPARE → IN_PROGRESS.
        assert_eq!(state.version, 2);
        assert_eq!(state.action, Action::None);
    }

    #[test]
    fn hybrid_log_walk_skips_index_phases() {
        let mut state = SystemState::new(Action::CheckpointHybridLog, Phase::Rest, 5);
        state = state.next().unwrap();
        assert_eq!(state.phase, Phase::Prepare);
        state = state.next().unwrap();
        assert_eq!(state.phase, Phase::InProgress);
        assert_eq!(state.version, 6);
    }

    #[test]
    fn index_only_walk_keeps_version() {
        let mut state = SystemState::new(Action::CheckpointIndex, Phase::Rest, 9);
        while !matches!((state.action, state.phase), (Action::None, Phase::Rest)) {
            state = state.next().unwrap();
        }
        assert_eq!(state.version, 9);
    }

    #[test]
    fn start_excludes_concurrent_actions() {
        let state = AtomicSystemState::default();
        assert!(state.try_start(Action::CheckpointFull).is_ok());
        assert!(state.try_start(Action::GrowIndex).is_err());
    }

    #[test]
    fn advance_walks_to_rest() {
        let state = AtomicSystemState::default();
        state.try_start(Action::GrowIndex).unwrap();
        assert_eq!(state.phase(), Phase::GrowPrepare);
        state.try_advance().unwrap();
        assert_eq!(state.phase(), Phase::GrowInProgress);
        state.try_advance().unwrap();
        assert_eq!(state.phase(), Phase::Rest);
        assert!(state.try_advance().is_err());
    }
}
