//! Store construction settings and their validation.

use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::ReadCacheConfig;
use crate::checkpoint::{CheckpointManager, CheckpointVariant};
use crate::hlog::LogConfig;
use crate::utility::next_power_of_two;

/// Contradictory or missing settings; fatal at construction.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("hash table size must be non-zero")]
    ZeroTableSize,
    #[error("log memory budget (2^{memory_bits}) must hold at least two pages (2^{page_bits})")]
    MemoryTooSmall { memory_bits: u32, page_bits: u32 },
    #[error("mutable fraction {0} outside (0, 1]")]
    BadMutableFraction(f64),
    #[error("read cache budget (2^{memory_bits}) must hold at least two pages (2^{page_bits})")]
    CacheTooSmall { memory_bits: u32, page_bits: u32 },
    #[error("read cache second-chance fraction {0} outside [0, 1]")]
    BadSecondChanceFraction(f64),
    #[error("checkpoint directory could not be prepared: {0}")]
    CheckpointDir(#[from] std::io::Error),
}

/// Hybrid-log geometry and read-path options.
#[derive(Debug, Clone)]
pub struct LogSettings {
    /// Page size = `1 << page_bits` bytes.
    pub page_bits: u32,
    /// In-memory budget = `1 << memory_bits` bytes.
    pub memory_bits: u32,
    /// Device segment size = `1 << segment_bits` bytes.
    pub segment_bits: u32,
    /// Fraction of memory kept in-place updatable.
    pub mutable_fraction: f64,
    /// Append a copy of disk-read records at the log tail (when the read
    /// cache is disabled).
    pub copy_reads_to_tail: bool,
    /// Optional read cache in front of the on-disk region.
    pub read_cache: Option<ReadCacheConfig>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            page_bits: 22,
            memory_bits: 29,
            segment_bits: 30,
            mutable_fraction: 0.9,
            copy_reads_to_tail: false,
            read_cache: None,
        }
    }
}

/// Where checkpoint artifacts go.
///
/// Exactly one backend exists by construction; the "both configured" error
/// class from looser APIs cannot occur.
#[derive(Clone)]
pub enum CheckpointBackend {
    /// Default local-filesystem layout under this directory.
    Directory(PathBuf),
    /// Caller-provided manager.
    Manager(Arc<dyn CheckpointManager>),
}

impl std::fmt::Debug for CheckpointBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointBackend::Directory(dir) => {
                f.debug_tuple("Directory").field(dir).finish()
            }
            CheckpointBackend::Manager(_) => f.write_str("Manager(..)"),
        }
    }
}

/// Checkpointing configuration.
#[derive(Debug, Clone)]
pub struct CheckpointSettings {
    pub backend: CheckpointBackend,
    pub variant: CheckpointVariant,
}

impl CheckpointSettings {
    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: CheckpointBackend::Directory(dir.into()),
            variant: CheckpointVariant::default(),
        }
    }

    pub fn manager(manager: Arc<dyn CheckpointManager>) -> Self {
        Self {
            backend: CheckpointBackend::Manager(manager),
            variant: CheckpointVariant::default(),
        }
    }

    pub fn with_variant(mut self, variant: CheckpointVariant) -> Self {
        self.variant = variant;
        self
    }
}

/// Everything a store is built from.
#[derive(Debug, Clone)]
pub struct StoreSettings {
    /// Number of 64-byte hash buckets; rounded up to a power of two.
    pub hash_table_size: u64,
    pub log: LogSettings,
    pub checkpoint: Option<CheckpointSettings>,
    /// Exclude in-flight pending operations from checkpoints instead of
    /// waiting for them. Construction-time only; toggling this mid-run
    /// would race the checkpoint state machine.
    pub relaxed_cpr: bool,
}

impl StoreSettings {
    pub fn new(hash_table_size: u64) -> Self {
        Self {
            hash_table_size,
            log: LogSettings::default(),
            checkpoint: None,
            relaxed_cpr: false,
        }
    }

    /// Validate and derive the internal configs.
    pub(crate) fn resolve(&self) -> Result<(u64, LogConfig), SettingsError> {
        if self.hash_table_size == 0 {
            return Err(SettingsError::ZeroTableSize);
        }
        let table_size = next_power_of_two(self.hash_table_size);

        let log = &self.log;
        if log.memory_bits < log.page_bits + 1 {
            return Err(SettingsError::MemoryTooSmall {
                memory_bits: log.memory_bits,
                page_bits: log.page_bits,
            });
        }
        if !(log.mutable_fraction > 0.0 && log.mutable_fraction <= 1.0) {
            return Err(SettingsError::BadMutableFraction(log.mutable_fraction));
        }
        if let Some(cache) = &log.read_cache {
            if cache.memory_bits < cache.page_bits + 1 {
                return Err(SettingsError::CacheTooSmall {
                    memory_bits: cache.memory_bits,
                    page_bits: cache.page_bits,
                });
            }
            if !(0.0..=1.0).contains(&cache.second_chance_fraction) {
                return Err(SettingsError::BadSecondChanceFraction(
                    cache.second_chance_fraction,
                ));
            }
        }

        Ok((
            table_size,
            LogConfig::new(log.page_bits, log.memory_bits, log.mutable_fraction),
        ))
    }
}
