//! Checkpoint and recovery tests: full round trips, prefix consistency,
//! and session continuation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tidekv::{
    CheckpointSettings, CheckpointVariant, OverwriteFunctions, SegmentedDisk, Status,
    StoreSettings, TideKv,
};

type Store = TideKv<u64, u64, OverwriteFunctions, SegmentedDisk>;

struct TestDirs {
    _root: tempfile::TempDir,
    log_dir: std::path::PathBuf,
    checkpoint_dir: std::path::PathBuf,
}

fn test_dirs() -> TestDirs {
    let root = tempfile::tempdir().unwrap();
    let log_dir = root.path().join("log");
    let checkpoint_dir = root.path().join("checkpoints");
    TestDirs {
        _root: root,
        log_dir,
        checkpoint_dir,
    }
}

fn settings(dirs: &TestDirs, variant: CheckpointVariant) -> StoreSettings {
    let mut settings = StoreSettings::new(1 << 12);
    settings.log.page_bits = 14; // 16 KiB pages
    settings.log.memory_bits = 21; // 2 MiB in memory
    settings.checkpoint =
        Some(CheckpointSettings::directory(&dirs.checkpoint_dir).with_variant(variant));
    settings
}

fn open_store(dirs: &TestDirs, variant: CheckpointVariant) -> Arc<Store> {
    let device = Arc::new(SegmentedDisk::open(&dirs.log_dir, "log", 26).unwrap());
    Arc::new(TideKv::new(settings(dirs, variant), OverwriteFunctions, device).unwrap())
}

#[test]
fn full_checkpoint_recovers_all_keys() {
    let dirs = test_dirs();
    let token;
    {
        let store = open_store(&dirs, CheckpointVariant::FoldOver);
        let mut session = store.start_session().unwrap();
        for key in 0..10_000u64 {
            assert_eq!(session.upsert(&key, &(key * 3), key + 1), Status::Ok);
        }
        token = store.take_full_checkpoint().unwrap();
        assert_eq!(store.complete_checkpoint(token, false), Status::Ok);
        drop(session);
    }

    let device = Arc::new(SegmentedDisk::open(&dirs.log_dir, "log", 26).unwrap());
    let store: Arc<Store> = Arc::new(
        TideKv::recover(
            settings(&dirs, CheckpointVariant::FoldOver),
            OverwriteFunctions,
            device,
            token,
        )
        .unwrap(),
    );

    let mut session = store.start_session().unwrap();
    for key in 0..10_000u64 {
        let (status, value) = session.read(&key, &0, key + 1);
        assert_eq!(status, Status::Ok, "key {key} lost in recovery");
        assert_eq!(value, Some(key * 3), "key {key} has wrong value");
    }
    assert_eq!(store.entry_count(), 10_000);
}

#[test]
fn recover_latest_picks_newest_checkpoint() {
    let dirs = test_dirs();
    {
        let store = open_store(&dirs, CheckpointVariant::FoldOver);
        let mut session = store.start_session().unwrap();
        session.upsert(&1, &10, 1);
        store.take_full_checkpoint().unwrap();
        session.upsert(&1, &20, 2);
        session.upsert(&2, &30, 3);
        store.take_full_checkpoint().unwrap();
        drop(session);
    }

    let device = Arc::new(SegmentedDisk::open(&dirs.log_dir, "log", 26).unwrap());
    let (_token, store) = TideKv::<u64, u64, _, _>::recover_latest(
        settings(&dirs, CheckpointVariant::FoldOver),
        OverwriteFunctions,
        device,
    )
    .unwrap();
    let store = Arc::new(store);

    let mut session = store.start_session().unwrap();
    assert_eq!(session.read(&1, &0, 1), (Status::Ok, Some(20)));
    assert_eq!(session.read(&2, &0, 2), (Status::Ok, Some(30)));
}

#[test]
fn snapshot_variant_recovers() {
    let dirs = test_dirs();
    let token;
    {
        let store = open_store(&dirs, CheckpointVariant::Snapshot);
        let mut session = store.start_session().unwrap();
        for key in 0..2000u64 {
            session.upsert(&key, &(key + 7), key + 1);
        }
        token = store.take_full_checkpoint().unwrap();
        // Writes after the cut are not part of the checkpoint.
        session.upsert(&99_999, &1, 5000);
        drop(session);
    }

    let device = Arc::new(SegmentedDisk::open(&dirs.log_dir, "log", 26).unwrap());
    let store: Arc<Store> = Arc::new(
        TideKv::recover(
            settings(&dirs, CheckpointVariant::Snapshot),
            OverwriteFunctions,
            device,
            token,
        )
        .unwrap(),
    );

    let mut session = store.start_session().unwrap();
    for key in 0..2000u64 {
        assert_eq!(session.read(&key, &0, key + 1), (Status::Ok, Some(key + 7)));
    }
    assert_eq!(session.read(&99_999, &0, 3000), (Status::NotFound, None));
}

#[test]
fn deletes_survive_recovery_as_tombstones() {
    let dirs = test_dirs();
    let token;
    {
        let store = open_store(&dirs, CheckpointVariant::FoldOver);
        let mut session = store.start_session().unwrap();
        for key in 0..100u64 {
            session.upsert(&key, &key, key + 1);
        }
        // Push everything into the append-only region so deletes must mask
        // rather than elide.
        for key in 100..2000u64 {
            session.upsert(&key, &key, key + 1);
        }
        session.delete(&5, 2001);
        session.delete(&6, 2002);
        token = store.take_full_checkpoint().unwrap();
        drop(session);
    }

    let device = Arc::new(SegmentedDisk::open(&dirs.log_dir, "log", 26).unwrap());
    let store: Arc<Store> = Arc::new(
        TideKv::recover(
            settings(&dirs, CheckpointVariant::FoldOver),
            OverwriteFunctions,
            device,
            token,
        )
        .unwrap(),
    );

    let mut session = store.start_session().unwrap();
    assert_eq!(session.read(&5, &0, 1), (Status::NotFound, None));
    assert_eq!(session.read(&6, &0, 2), (Status::NotFound, None));
    assert_eq!(session.read(&7, &0, 3), (Status::Ok, Some(7)));
}

#[test]
fn recovery_without_checkpoint_fails() {
    let dirs = test_dirs();
    let device = Arc::new(SegmentedDisk::open(&dirs.log_dir, "log", 26).unwrap());
    let result = TideKv::<u64, u64, _, _>::recover_latest(
        settings(&dirs, CheckpointVariant::FoldOver),
        OverwriteFunctions,
        device,
    );
    assert!(result.is_err());
}

#[test]
fn concurrent_sessions_recover_to_prefixes() {
    // Sessions A (even keys) and B (odd keys) upsert with increasing
    // serials while a checkpoint runs. After recovery each session's
    // visible writes are exactly the prefix up to its commit point.
    let dirs = test_dirs();
    let token;
    let guid_a;
    let guid_b;
    {
        let store = open_store(&dirs, CheckpointVariant::FoldOver);
        let done = Arc::new(AtomicBool::new(false));

        let writer = |parity: u64, done: Arc<AtomicBool>, store: Arc<Store>| {
            thread::spawn(move || {
                let mut session = store.start_session().unwrap();
                let guid = session.guid();
                let mut serial = 0u64;
                while !done.load(Ordering::Acquire) {
                    serial += 1;
                    let key = 2 * serial + parity;
                    assert_eq!(session.upsert(&key, &serial, serial), Status::Ok);
                }
                // A few extra refreshes so a final phase change is observed.
                for _ in 0..4 {
                    session.refresh();
                    thread::yield_now();
                }
                (guid, serial)
            })
        };

        let a = writer(0, done.clone(), store.clone());
        let b = writer(1, done.clone(), store.clone());

        // Let the writers make progress, then checkpoint mid-run.
        thread::sleep(std::time::Duration::from_millis(50));
        token = store.take_hybrid_log_checkpoint().unwrap();
        done.store(true, Ordering::Release);

        let (ga, _) = a.join().unwrap();
        let (gb, _) = b.join().unwrap();
        guid_a = ga;
        guid_b = gb;
    }

    let device = Arc::new(SegmentedDisk::open(&dirs.log_dir, "log", 26).unwrap());
    let store: Arc<Store> = Arc::new(
        TideKv::recover(
            settings(&dirs, CheckpointVariant::FoldOver),
            OverwriteFunctions,
            device,
            token,
        )
        .unwrap(),
    );

    // Each session recovers to its own commit point: every serial at or
    // below it is visible, everything after it is absent. No torn writes.
    let mut verify = |guid: uuid::Uuid, parity: u64| {
        let (mut session, point) = store.continue_session(guid).unwrap();
        assert!(point.serial > 0, "checkpoint should capture progress");
        let mut probe = 0u64;
        for serial in 1..=point.serial {
            probe += 1;
            let key = 2 * serial + parity;
            let (status, value) = session.read(&key, &0, point.serial + probe);
            assert_eq!(status, Status::Ok, "serial {serial} inside the prefix");
            assert_eq!(value, Some(serial));
        }
        // Serials past the commit point were not recovered.
        for serial in (point.serial + 1)..(point.serial + 20) {
            probe += 1;
            let key = 2 * serial + parity;
            let (status, _) = session.read(&key, &0, point.serial + probe);
            assert_eq!(status, Status::NotFound, "serial {serial} past the prefix");
        }
    };
    verify(guid_a, 0);
    verify(guid_b, 1);
}

#[test]
fn index_only_checkpoint_commits() {
    let dirs = test_dirs();
    let store = open_store(&dirs, CheckpointVariant::FoldOver);
    let mut session = store.start_session().unwrap();
    for key in 0..500u64 {
        session.upsert(&key, &key, key + 1);
    }
    let token = store.take_index_checkpoint().unwrap();
    assert_eq!(store.complete_checkpoint(token, false), Status::Ok);
    assert!(dirs.checkpoint_dir.join(token.to_string()).join("index.dat").exists());
    assert!(dirs.checkpoint_dir.join(token.to_string()).join("info.dat").exists());
}

#[test]
fn unknown_session_cannot_continue() {
    let dirs = test_dirs();
    let store = open_store(&dirs, CheckpointVariant::FoldOver);
    assert!(store.continue_session(uuid::Uuid::new_v4()).is_err());
}
