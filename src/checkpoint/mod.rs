//! Checkpoint persistence: tokens, metadata, and the storage backend.

mod local;
mod metadata;
mod state_machine;

pub use local::LocalCheckpointManager;
pub use metadata::{
    CheckpointInfo, CheckpointKind, CommitPoint, CommitPoints, IndexMetadata, LogMetadata,
};
pub use state_machine::{Action, AtomicSystemState, Phase, SystemState};

use std::io::{self, Read, Seek, Write};

use uuid::Uuid;

/// Identifier of one checkpoint: a random 128-bit token.
pub type CheckpointToken = Uuid;

/// Checkpoint variant for the hybrid-log portion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointVariant {
    /// The read-only region *is* the checkpoint: advance the append-only
    /// boundary to the cut and flush the main device up to it.
    #[default]
    FoldOver,
    /// Copy the not-yet-flushed suffix to a separate snapshot file, leaving
    /// the live log untouched.
    Snapshot,
}

/// Seekable sink for bulk checkpoint data (`index.dat`, `snapshot.dat`).
pub trait CheckpointSink: Write + Seek + Send {}

impl<T: Write + Seek + Send> CheckpointSink for T {}

/// Storage backend for checkpoint artifacts.
///
/// The default implementation writes `index.dat`, `snapshot.dat`,
/// `info.dat`, and `commit.dat` under one directory per token; alternative
/// backends (object stores, test doubles) implement this trait.
pub trait CheckpointManager: Send + Sync + 'static {
    /// Prepare storage for a new checkpoint token.
    fn create(&self, token: CheckpointToken) -> io::Result<()>;

    /// Persist the combined metadata (`info.dat`).
    fn commit_info(&self, token: CheckpointToken, bytes: &[u8]) -> io::Result<()>;

    /// Persist per-session commit points (`commit.dat`).
    fn commit_points(&self, token: CheckpointToken, bytes: &[u8]) -> io::Result<()>;

    /// Sink for the hash-bucket image (`index.dat`).
    fn index_sink(&self, token: CheckpointToken) -> io::Result<Box<dyn CheckpointSink>>;

    /// Sink for the log snapshot (`snapshot.dat`).
    fn snapshot_sink(&self, token: CheckpointToken) -> io::Result<Box<dyn CheckpointSink>>;

    fn read_info(&self, token: CheckpointToken) -> io::Result<Vec<u8>>;

    fn read_points(&self, token: CheckpointToken) -> io::Result<Vec<u8>>;

    fn index_source(&self, token: CheckpointToken) -> io::Result<Box<dyn Read + Send>>;

    fn snapshot_source(&self, token: CheckpointToken) -> io::Result<Box<dyn Read + Send>>;

    /// Every token with a committed `info.dat`.
    fn list(&self) -> io::Result<Vec<CheckpointToken>>;

    /// Drop one checkpoint's artifacts.
    fn remove(&self, token: CheckpointToken) -> io::Result<()>;
}

/// Find the most recent recoverable checkpoint: the committed info with the
/// highest sequence number.
pub fn find_latest(
    manager: &dyn CheckpointManager,
) -> io::Result<Option<(CheckpointToken, CheckpointInfo)>> {
    let mut best: Option<(CheckpointToken, CheckpointInfo)> = None;
    for token in manager.list()? {
        let Ok(bytes) = manager.read_info(token) else {
            continue;
        };
        let Ok(info) = CheckpointInfo::from_json(&bytes) else {
            tracing::warn!(%token, "skipping checkpoint with unreadable info.dat");
            continue;
        };
        let newer = match &best {
            None => true,
            Some((_, current)) => info.sequence > current.sequence,
        };
        if newer {
            best = Some((token, info));
        }
    }
    Ok(best)
}
