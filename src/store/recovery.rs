//! Recovery: rebuild a store from a checkpoint.
//!
//! The index image (if any) gives the bucket array as of some earlier log
//! tail; the log replay scans forward from that tail to the checkpoint's
//! cut, re-linking each surviving record into its hash chain (later
//! addresses win, tombstones stay linked and mask older versions). Records
//! stamped with a version newer than the recovered one never become
//! reachable.

use std::io::{self, Read};
use std::sync::Arc;

use crate::address::Address;
use crate::checkpoint::{
    CheckpointInfo, CheckpointManager, CheckpointToken, CheckpointVariant, CommitPoints,
    IndexMetadata, LogMetadata, SystemState,
};
use crate::codec::{KeyCodec, StoreKey, StoreValue};
use crate::device::SyncDevice;
use crate::index::KeyHash;
use crate::record::{self, parse_record, ParsedRecord};
use crate::status::Status;
use crate::store::functions::StoreFunctions;
use crate::store::kv::TideKv;
use crate::store::settings::StoreSettings;

fn invalid_data(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}

impl<K, V, F, D> TideKv<K, V, F, D>
where
    K: StoreKey,
    V: StoreValue,
    F: StoreFunctions<K, V>,
    D: SyncDevice,
{
    /// Recover from the most recent recoverable checkpoint.
    pub fn recover_latest(
        settings: StoreSettings,
        functions: F,
        device: Arc<D>,
    ) -> io::Result<(CheckpointToken, Self)> {
        let store = Self::new(settings, functions, device)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let manager = store
            .checkpoint_manager
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no checkpoint backend"))?;
        // The newest recoverable checkpoint is the newest one with a log
        // cut; index-only checkpoints alone cannot rebuild state.
        let mut best: Option<(CheckpointToken, CheckpointInfo)> = None;
        for token in manager.list()? {
            let Ok(info) = CheckpointInfo::from_json(&manager.read_info(token)?) else {
                continue;
            };
            if info.log.is_none() {
                continue;
            }
            if best.as_ref().map_or(true, |(_, b)| info.sequence > b.sequence) {
                best = Some((token, info));
            }
        }
        let (token, info) = best
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no checkpoint found"))?;
        store.apply_checkpoint(&*manager, token, info)?;
        Ok((token, store))
    }

    /// Recover from an explicit checkpoint token.
    pub fn recover(
        settings: StoreSettings,
        functions: F,
        device: Arc<D>,
        token: CheckpointToken,
    ) -> io::Result<Self> {
        let store = Self::new(settings, functions, device)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let manager = store
            .checkpoint_manager
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no checkpoint backend"))?;
        let info = CheckpointInfo::from_json(&manager.read_info(token)?)?;
        store.apply_checkpoint(&*manager, token, info)?;
        Ok(store)
    }

    /// Recover pairing an explicit index checkpoint with a log checkpoint.
    pub fn recover_from_tokens(
        settings: StoreSettings,
        functions: F,
        device: Arc<D>,
        index_token: CheckpointToken,
        log_token: CheckpointToken,
    ) -> io::Result<Self> {
        let store = Self::new(settings, functions, device)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let manager = store
            .checkpoint_manager
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no checkpoint backend"))?;

        let log_info = CheckpointInfo::from_json(&manager.read_info(log_token)?)?;
        let log_meta = log_info
            .log
            .clone()
            .ok_or_else(|| invalid_data("log token has no hybrid-log metadata"))?;
        let index_info = CheckpointInfo::from_json(&manager.read_info(index_token)?)?;
        let index_meta = index_info
            .index
            .ok_or_else(|| invalid_data("index token has no index metadata"))?;
        if index_meta.checkpoint_start_address > log_meta.final_address {
            return Err(invalid_data(
                "index checkpoint is newer than the log checkpoint cut",
            ));
        }

        store.restore_state(&*manager, Some((index_token, index_meta)), &log_meta)?;
        store.restore_sessions(&*manager, log_token)?;
        store
            .checkpoint_sequence
            .store(log_info.sequence, std::sync::atomic::Ordering::Release);
        Ok(store)
    }

    fn apply_checkpoint(
        &self,
        manager: &dyn CheckpointManager,
        token: CheckpointToken,
        info: CheckpointInfo,
    ) -> io::Result<()> {
        let log_meta = info
            .log
            .clone()
            .ok_or_else(|| invalid_data("checkpoint has no hybrid-log metadata"))?;

        // Use this token's index image when present; otherwise the newest
        // index checkpoint whose tail does not pass the log cut.
        let index = match info.index.clone() {
            Some(meta) => Some((token, meta)),
            None => self.find_compatible_index(manager, log_meta.final_address)?,
        };

        self.restore_state(manager, index, &log_meta)?;
        self.restore_sessions(manager, token)?;
        self.checkpoint_sequence
            .store(info.sequence, std::sync::atomic::Ordering::Release);
        Ok(())
    }

    fn find_compatible_index(
        &self,
        manager: &dyn CheckpointManager,
        cut: u64,
    ) -> io::Result<Option<(CheckpointToken, IndexMetadata)>> {
        let mut best: Option<(CheckpointToken, IndexMetadata)> = None;
        for candidate in manager.list()? {
            let Ok(bytes) = manager.read_info(candidate) else {
                continue;
            };
            let Ok(info) = CheckpointInfo::from_json(&bytes) else {
                continue;
            };
            let Some(index) = info.index else { continue };
            if index.checkpoint_start_address > cut {
                continue;
            }
            let better = match &best {
                None => true,
                Some((_, current)) => {
                    index.checkpoint_start_address > current.checkpoint_start_address
                }
            };
            if better {
                best = Some((candidate, index));
            }
        }
        Ok(best)
    }

    fn restore_state(
        &self,
        manager: &dyn CheckpointManager,
        index: Option<(CheckpointToken, IndexMetadata)>,
        log_meta: &LogMetadata,
    ) -> io::Result<()> {
        let begin = log_meta.begin_addr();
        let cut = log_meta.final_addr();
        let version = log_meta.version;
        tracing::info!(
            token = %log_meta.token,
            version,
            begin = begin.control(),
            cut = cut.control(),
            "recovery start"
        );

        // Snapshot checkpoints keep the suffix in a side file: replay it
        // onto the main device so the address space below the cut is whole.
        if log_meta.variant == CheckpointVariant::Snapshot {
            let mut source = manager.snapshot_source(log_meta.token)?;
            let mut offset = log_meta.snapshot_start_address;
            let mut buf = vec![0u8; 1 << 20];
            loop {
                let read = source.read(&mut buf)?;
                if read == 0 {
                    break;
                }
                self.hlog
                    .device()
                    .write_at(offset, &buf[..read])
                    .map_err(|e| io::Error::other(e.to_string()))?;
                offset += read as u64;
            }
            if offset < cut.control() {
                return Err(invalid_data("snapshot file shorter than the log cut"));
            }
        }

        // Bucket image, if we have one.
        let scan_start = match index {
            Some((index_token, meta)) => {
                let mut source = manager.index_source(index_token)?;
                // SAFETY: recovery runs before any session exists.
                unsafe { self.index_mut() }.read_snapshot(&mut source)?;
                Address::new(meta.checkpoint_start_address).max(begin)
            }
            None => begin,
        };

        // Reload the cut's page prefix so appends continue in place.
        let page_bits = self.hlog.config().page_bits;
        let page_head = Address::new((cut.page(page_bits)) << page_bits);
        let prefix_len = (cut - page_head) as usize;
        let mut tail_page_bytes = vec![0u8; prefix_len];
        if prefix_len > 0 {
            self.hlog
                .device()
                .read_at(page_head.control(), &mut tail_page_bytes)?;
        }
        self.hlog.restore(begin, cut, &tail_page_bytes);

        let relinked = self.replay_chains(scan_start, cut, version)?;
        self.state
            .store(SystemState::rest(version), std::sync::atomic::Ordering::Release);
        tracing::info!(relinked, "recovery replay done");
        Ok(())
    }

    /// Scan `[from, cut)` on the device, re-linking every surviving record
    /// into the hash index.
    fn replay_chains(&self, from: Address, cut: Address, version: u32) -> io::Result<u64> {
        let page_bits = self.hlog.config().page_bits;
        let page_size = self.hlog.config().page_size() as usize;
        let mut relinked = 0u64;
        let mut page_buf = vec![0u8; page_size];

        let mut cursor = from;
        while cursor < cut {
            let page_start = Address::new(cursor.page(page_bits) << page_bits);
            let page_end = Address::new(page_start.control() + page_size as u64).min(cut);
            let span = (page_end - page_start) as usize;
            self.hlog
                .device()
                .read_at(page_start.control(), &mut page_buf[..span])?;

            let mut offset = (cursor - page_start) as usize;
            while offset + record::HEADER_SIZE <= span {
                let record = match parse_record::<K, V>(&page_buf[offset..span]) {
                    Ok(ParsedRecord::Ok(record)) => record,
                    // Zero header or a record that did not fit before the
                    // cut: the rest of this page is padding.
                    Ok(ParsedRecord::Truncated(_)) | Err(Status::NotFound) => break,
                    Err(_) => {
                        return Err(invalid_data(format!(
                            "corrupt record at {}",
                            page_start.control() + offset as u64
                        )))
                    }
                };
                let advance = record::record_alloc_len::<K, V>(&record);
                let address = page_start + offset as u64;

                let keep = !record.is_invalid()
                    && !record.in_new_version()
                    && record.version() <= version;
                if keep {
                    let hash = KeyHash::new(<K as StoreKey>::Codec::hash_encoded(record.key));
                    let slot = self.index().find_or_create_entry(hash);
                    // Forward scan: the latest record for each key wins.
                    if self.index().try_update_entry(&slot, address, hash.tag()) {
                        relinked += 1;
                    }
                }
                offset += advance;
            }
            cursor = Address::new(page_end.control().max(page_start.control() + page_size as u64));
        }
        Ok(relinked)
    }

    fn restore_sessions(
        &self,
        manager: &dyn CheckpointManager,
        token: CheckpointToken,
    ) -> io::Result<()> {
        let points = match manager.read_points(token) {
            Ok(bytes) => CommitPoints::from_json(&bytes)?,
            // Index-only checkpoints carry no commit points.
            Err(err) if err.kind() == io::ErrorKind::NotFound => CommitPoints::default(),
            Err(err) => return Err(err),
        };
        let mut recovered = self.recovered_sessions.lock();
        recovered.clear();
        for point in points.points {
            recovered.insert(point.guid, point);
        }
        Ok(())
    }
}
