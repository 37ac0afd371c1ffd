//! Disk spill and pending-I/O tests: reads below the eviction boundary go
//! pending, complete through the background worker, and land in the read
//! cache when one is configured.

mod common;

use std::sync::Arc;

use common::CapturingFunctions;
use tidekv::{ReadCacheConfig, SegmentedDisk, Status, StoreSettings, TideKv};

type Store = TideKv<u64, u64, CapturingFunctions, SegmentedDisk>;

fn spill_settings(read_cache: bool) -> StoreSettings {
    let mut settings = StoreSettings::new(1 << 14);
    settings.log.page_bits = 12; // 4 KiB pages
    settings.log.memory_bits = 15; // 32 KiB in memory: 8 pages
    settings.log.mutable_fraction = 0.5;
    if read_cache {
        settings.log.read_cache = Some(ReadCacheConfig::new(12, 14, 0.5));
    }
    settings
}

fn spill_store(dir: &std::path::Path, read_cache: bool) -> (Arc<Store>, CapturingFunctions) {
    let functions = CapturingFunctions::default();
    let device = Arc::new(SegmentedDisk::open(dir, "log", 22).unwrap());
    let store =
        Arc::new(TideKv::new(spill_settings(read_cache), functions.clone(), device).unwrap());
    (store, functions)
}

/// Write enough records that the early ones migrate to disk.
fn fill_past_memory(session: &mut tidekv::Session<u64, u64, CapturingFunctions, SegmentedDisk>) {
    // 4000 records x 24 bytes is ~3x the memory budget.
    for key in 0..4000u64 {
        assert_eq!(session.upsert(&key, &(key * 11), key + 1), Status::Ok);
    }
}

#[test]
fn spilled_read_goes_pending_then_completes() {
    let dir = tempfile::tempdir().unwrap();
    let (store, functions) = spill_store(dir.path(), false);
    let mut session = store.start_session().unwrap();
    fill_past_memory(&mut session);

    let stats = store.log_stats();
    assert!(
        stats.head_address > stats.begin_address,
        "fill must evict pages (head {} begin {})",
        stats.head_address,
        stats.begin_address
    );

    // Key 0 was written first; its record is on disk by now.
    let (status, value) = session.read(&0, &0, 10_000);
    assert_eq!(status, Status::Pending);
    assert!(value.is_none());
    assert_eq!(session.get_pending_requests(), vec![10_000]);

    assert!(session.complete_pending(true));
    assert!(session.get_pending_requests().is_empty());

    let (status, value) = functions.0.read_result(10_000).expect("completion delivered");
    assert_eq!(status, Status::Ok);
    assert_eq!(value, Some(0));
}

#[test]
fn pending_read_of_missing_key_completes_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let (store, functions) = spill_store(dir.path(), false);
    let mut session = store.start_session().unwrap();
    fill_past_memory(&mut session);

    // Delete a spilled key; the tombstone masks the disk record.
    assert_eq!(session.delete(&1, 9000), Status::Ok);
    let (status, _) = session.read(&1, &0, 9001);
    // The tombstone sits at the tail, so the miss resolves in memory.
    assert_eq!(status, Status::NotFound);

    // A key that never existed but whose slot has spilled records may go
    // pending; completion must deliver NotFound.
    let (status, _) = session.read(&4_000_001, &0, 9002);
    if status == Status::Pending {
        assert!(session.complete_pending(true));
        let (status, value) = functions.0.read_result(9002).expect("completion");
        assert_eq!(status, Status::NotFound);
        assert!(value.is_none());
    } else {
        assert_eq!(status, Status::NotFound);
    }
}

#[test]
fn read_cache_serves_second_read_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    let (store, functions) = spill_store(dir.path(), true);
    let mut session = store.start_session().unwrap();
    fill_past_memory(&mut session);

    // First read of a spilled key: pending.
    let (status, _) = session.read(&3, &0, 20_000);
    assert_eq!(status, Status::Pending);
    assert!(session.complete_pending(true));
    let (status, value) = functions.0.read_result(20_000).expect("completion");
    assert_eq!(status, Status::Ok);
    assert_eq!(value, Some(33));

    // The completion installed a cache copy: the second read hits it
    // without going pending.
    let (status, value) = session.read(&3, &0, 20_001);
    assert_eq!(status, Status::Ok);
    assert_eq!(value, Some(33));
    let cache_stats = store.read_cache_stats().expect("cache enabled");
    assert!(cache_stats.inserts() >= 1);
    assert!(cache_stats.hits() >= 1);
}

#[test]
fn update_invalidates_cached_copy() {
    let dir = tempfile::tempdir().unwrap();
    let (store, functions) = spill_store(dir.path(), true);
    let mut session = store.start_session().unwrap();
    fill_past_memory(&mut session);

    // Cache key 5.
    let (status, _) = session.read(&5, &0, 30_000);
    assert_eq!(status, Status::Pending);
    assert!(session.complete_pending(true));
    assert_eq!(
        functions.0.read_result(30_000).map(|(_, v)| v),
        Some(Some(55))
    );

    // Overwrite; the cached copy must not shadow the new value.
    assert_eq!(session.upsert(&5, &555, 30_001), Status::Ok);
    let (status, value) = session.read(&5, &0, 30_002);
    assert_eq!(status, Status::Ok);
    assert_eq!(value, Some(555));
}

#[test]
fn pending_rmw_applies_over_disk_value() {
    let dir = tempfile::tempdir().unwrap();
    let (store, functions) = spill_store(dir.path(), false);
    let mut session = store.start_session().unwrap();
    fill_past_memory(&mut session);

    // Key 2 holds 22 on disk; RMW adds 8.
    let status = session.rmw(&2, &8, 40_000);
    assert_eq!(status, Status::Pending);
    assert!(session.complete_pending(true));
    assert_eq!(
        functions.0.completed_rmws.lock().as_slice(),
        &[(40_000, Status::Ok)]
    );

    let (status, value) = session.read(&2, &0, 40_001);
    assert_eq!(status, Status::Ok);
    assert_eq!(value, Some(30));
}

#[test]
fn spilled_keys_all_readable_via_complete_pending() {
    let dir = tempfile::tempdir().unwrap();
    let (store, functions) = spill_store(dir.path(), false);
    let mut session = store.start_session().unwrap();
    fill_past_memory(&mut session);

    let mut serial = 100_000u64;
    let mut pending = Vec::new();
    for key in (0..200u64).step_by(7) {
        serial += 1;
        match session.read(&key, &0, serial) {
            (Status::Ok, Some(value)) => assert_eq!(value, key * 11),
            (Status::Pending, _) => pending.push((serial, key)),
            other => panic!("unexpected read result {other:?} for key {key}"),
        }
    }
    assert!(session.complete_pending(true));
    for (serial, key) in pending {
        let (status, value) = functions.0.read_result(serial).expect("completion");
        assert_eq!(status, Status::Ok, "key {key}");
        assert_eq!(value, Some(key * 11), "key {key}");
    }
}
