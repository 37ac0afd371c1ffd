//! tidekv — a high-throughput concurrent key-value store over a hybrid log.
//!
//! The store keeps a single logical append-only log whose newest region
//! lives in memory (in-place updatable), whose middle region is in-memory
//! but append-only, and whose cold prefix lives on a storage device. A
//! latch-free hash index maps key hashes to per-key record chains in the
//! log; epoch-based reclamation lets readers, writers, and background
//! flush/eviction proceed without global locks. Durability comes from
//! concurrent prefix recovery (CPR) checkpoints: each session recovers to a
//! prefix of its own operation sequence, without stopping the world.
//!
//! # Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tidekv::{NullDevice, OverwriteFunctions, Status, StoreSettings, TideKv};
//!
//! let store = Arc::new(TideKv::new(
//!     StoreSettings::new(1 << 16),
//!     OverwriteFunctions,
//!     Arc::new(NullDevice::new()),
//! )?);
//!
//! let mut session = store.start_session()?;
//! session.upsert(&1u64, &100u64, 1);
//! let (status, value) = session.read(&1u64, &0, 2);
//! assert_eq!(status, Status::Ok);
//! assert_eq!(value, Some(100));
//! ```

#![allow(dead_code)]

pub mod address;
pub mod cache;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod device;
pub mod epoch;
pub mod hlog;
pub mod index;
pub mod record;
pub mod status;
pub mod store;
mod utility;

pub use address::Address;
pub use cache::ReadCacheConfig;
pub use checkpoint::{CheckpointKind, CheckpointToken, CheckpointVariant, CommitPoint};
pub use codec::{Bytes, Serde, Str, StoreKey, StoreValue};
pub use device::{NullDevice, SegmentedDisk, SyncDevice};
pub use status::Status;
pub use store::{
    AddFunctions, CheckpointSettings, LogSettings, OverwriteFunctions, Session, SettingsError,
    StoreFunctions, StoreSettings, TideKv,
};

/// Prelude for the common imports.
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::codec::{StoreKey, StoreValue};
    pub use crate::status::Status;
    pub use crate::store::{Session, StoreFunctions, StoreSettings, TideKv};
}
