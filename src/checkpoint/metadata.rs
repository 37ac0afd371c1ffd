//! Checkpoint metadata records, serialized as JSON into `info.dat` and
//! `commit.dat`.

use std::io;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::Address;

use super::{CheckpointToken, CheckpointVariant};

/// What a checkpoint covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    Full,
    IndexOnly,
    HybridLogOnly,
}

/// Metadata for a hash-index image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub token: CheckpointToken,
    /// CPR version at capture time.
    pub version: u32,
    pub table_size: u64,
    pub overflow_buckets: u64,
    pub num_entries: u64,
    /// Log begin address at capture time.
    pub begin_address: u64,
    /// Log tail when the bucket image was taken; recovery replays the log
    /// from here.
    pub checkpoint_start_address: u64,
}

/// Metadata for a hybrid-log checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMetadata {
    pub token: CheckpointToken,
    pub version: u32,
    pub variant: CheckpointVariant,
    pub begin_address: u64,
    /// The version cut: the recovered log ends here.
    pub final_address: u64,
    /// Device-durable prefix at capture time.
    pub flushed_until_address: u64,
    /// First address covered by `snapshot.dat` (snapshot variant only).
    pub snapshot_start_address: u64,
}

impl LogMetadata {
    #[inline]
    pub fn final_addr(&self) -> Address {
        Address::new(self.final_address)
    }

    #[inline]
    pub fn begin_addr(&self) -> Address {
        Address::new(self.begin_address)
    }
}

/// One session's recovery barrier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitPoint {
    pub guid: Uuid,
    /// Highest serial number whose effects are in the recovered prefix.
    pub serial: u64,
    /// Serials excluded from the prefix (operations that were pending when
    /// the store ran in relaxed CPR mode).
    #[serde(default)]
    pub excluded_serials: Vec<u64>,
}

/// The combined `info.dat` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub token: CheckpointToken,
    pub kind: CheckpointKind,
    /// Monotonic ordering across checkpoints of one store lineage.
    pub sequence: u64,
    pub index: Option<IndexMetadata>,
    pub log: Option<LogMetadata>,
}

impl CheckpointInfo {
    pub fn to_json(&self) -> io::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(io::Error::other)
    }

    pub fn from_json(bytes: &[u8]) -> io::Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// The `commit.dat` payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommitPoints {
    pub points: Vec<CommitPoint>,
}

impl CommitPoints {
    pub fn to_json(&self) -> io::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(io::Error::other)
    }

    pub fn from_json(bytes: &[u8]) -> io::Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_roundtrip() {
        let token = Uuid::new_v4();
        let info = CheckpointInfo {
            token,
            kind: CheckpointKind::Full,
            sequence: 3,
            index: Some(IndexMetadata {
                token,
                version: 2,
                table_size: 128,
                overflow_buckets: 1,
                num_entries: 42,
                begin_address: 64,
                checkpoint_start_address: 9000,
            }),
            log: Some(LogMetadata {
                token,
                version: 2,
                variant: CheckpointVariant::FoldOver,
                begin_address: 64,
                final_address: 10_000,
                flushed_until_address: 10_000,
                snapshot_start_address: 0,
            }),
        };

        let bytes = info.to_json().unwrap();
        let parsed = CheckpointInfo::from_json(&bytes).unwrap();
        assert_eq!(parsed.token, token);
        assert_eq!(parsed.sequence, 3);
        assert_eq!(parsed.index.unwrap().num_entries, 42);
        assert_eq!(parsed.log.unwrap().final_address, 10_000);
    }

    #[test]
    fn commit_points_roundtrip() {
        let points = CommitPoints {
            points: vec![CommitPoint {
                guid: Uuid::new_v4(),
                serial: 77,
                excluded_serials: vec![75],
            }],
        };
        let bytes = points.to_json().unwrap();
        let parsed = CommitPoints::from_json(&bytes).unwrap();
        assert_eq!(parsed.points.len(), 1);
        assert_eq!(parsed.points[0].serial, 77);
        assert_eq!(parsed.points[0].excluded_serials, vec![75]);
    }

    #[test]
    fn from_json_rejects_garbage() {
        assert!(CheckpointInfo::from_json(b"not json").is_err());
    }
}
