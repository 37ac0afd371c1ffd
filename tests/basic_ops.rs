//! Basic operation tests: upsert/read/delete against an in-memory store.

use std::sync::Arc;

use tidekv::{NullDevice, OverwriteFunctions, Status, StoreSettings, TideKv};

type Store = TideKv<u64, u64, OverwriteFunctions, NullDevice>;

/// The literal small-store setup: 128 buckets, 64 KiB of memory, 4 KiB
/// pages, integer keys and values.
fn create_store() -> Arc<Store> {
    let mut settings = StoreSettings::new(128);
    settings.log.page_bits = 12;
    settings.log.memory_bits = 16;
    Arc::new(TideKv::new(settings, OverwriteFunctions, Arc::new(NullDevice::new())).unwrap())
}

#[test]
fn upsert_read_delete_roundtrip() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    assert_eq!(session.upsert(&1, &100, 1), Status::Ok);
    assert_eq!(session.upsert(&2, &200, 2), Status::Ok);

    assert_eq!(session.read(&1, &0, 3), (Status::Ok, Some(100)));
    assert_eq!(session.read(&2, &0, 4), (Status::Ok, Some(200)));

    assert_eq!(session.delete(&1, 5), Status::Ok);
    assert_eq!(session.read(&1, &0, 6), (Status::NotFound, None));
    assert_eq!(session.read(&2, &0, 7), (Status::Ok, Some(200)));
}

#[test]
fn read_missing_key() {
    let store = create_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.read(&999, &0, 1), (Status::NotFound, None));
}

#[test]
fn delete_missing_key() {
    let store = create_store();
    let mut session = store.start_session().unwrap();
    assert_eq!(session.delete(&999, 1), Status::NotFound);
}

#[test]
fn upsert_overwrites() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&42, &1, 1);
    assert_eq!(session.read(&42, &0, 2), (Status::Ok, Some(1)));
    session.upsert(&42, &2, 3);
    assert_eq!(session.read(&42, &0, 4), (Status::Ok, Some(2)));
    session.upsert(&42, &3, 5);
    assert_eq!(session.read(&42, &0, 6), (Status::Ok, Some(3)));
}

#[test]
fn many_keys_roundtrip() {
    let store = create_store();
    let mut session = store.start_session().unwrap();
    let mut serial = 0;

    for key in 1..=1000u64 {
        serial += 1;
        assert_eq!(session.upsert(&key, &(key * 10), serial), Status::Ok);
    }
    for key in 1..=1000u64 {
        serial += 1;
        let (status, value) = session.read(&key, &0, serial);
        assert_eq!(status, Status::Ok, "key {key}");
        assert_eq!(value, Some(key * 10), "key {key}");
    }
}

#[test]
fn entry_count_tracks_distinct_keys() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    for key in 1..=50u64 {
        session.upsert(&key, &key, key);
    }
    assert_eq!(store.entry_count(), 50);

    // Overwrites do not add entries.
    for key in 1..=50u64 {
        session.upsert(&key, &(key + 1), 50 + key);
    }
    assert_eq!(store.entry_count(), 50);
}

#[test]
fn contains_key_in_memory_probes_resident_chain() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    session.upsert(&7, &70, 1);
    assert_eq!(store.contains_key_in_memory(&7, None), Status::Ok);
    assert_eq!(store.contains_key_in_memory(&8, None), Status::NotFound);

    session.delete(&7, 2);
    assert_eq!(store.contains_key_in_memory(&7, None), Status::NotFound);
}

#[test]
fn index_size_reports_rounded_bucket_count() {
    let store = create_store();
    assert_eq!(store.index_size(), 128);
}

#[test]
fn frontier_invariant_after_writes() {
    let store = create_store();
    let mut session = store.start_session().unwrap();
    for key in 0..2000u64 {
        session.upsert(&key, &key, key + 1);
    }
    let stats = store.log_stats();
    assert!(stats.begin_address <= stats.head_address);
    assert!(stats.head_address <= stats.safe_head_address);
    assert!(stats.safe_head_address <= stats.read_only_address);
    assert!(stats.read_only_address <= stats.safe_read_only_address);
    assert!(stats.safe_read_only_address <= stats.tail_address);
}

#[test]
fn sessions_are_independent() {
    let store = create_store();
    let mut a = store.start_session().unwrap();
    let mut b = store.start_session().unwrap();

    a.upsert(&1, &10, 1);
    b.upsert(&2, &20, 1);

    assert_eq!(a.read(&2, &0, 2), (Status::Ok, Some(20)));
    assert_eq!(b.read(&1, &0, 2), (Status::Ok, Some(10)));
    assert_ne!(a.guid(), b.guid());
}

#[test]
fn variable_length_values_roundtrip() {
    use tidekv::Bytes;

    let mut settings = StoreSettings::new(128);
    settings.log.page_bits = 12;
    settings.log.memory_bits = 16;
    let store = Arc::new(
        TideKv::<Bytes, Bytes, _, _>::new(settings, OverwriteFunctions, Arc::new(NullDevice::new()))
            .unwrap(),
    );
    let mut session = store.start_session().unwrap();

    let key = Bytes::from(b"config/listen-address".as_slice());
    let value = Bytes::from(b"0.0.0.0:7700".as_slice());
    assert_eq!(session.upsert(&key, &value, 1), Status::Ok);

    let (status, read) = session.read(&key, &Bytes::default(), 2);
    assert_eq!(status, Status::Ok);
    assert_eq!(read, Some(value));

    // A longer replacement value forces the append path.
    let longer = Bytes::from(b"[::]:7700 # dual-stack listener".as_slice());
    assert_eq!(session.upsert(&key, &longer, 3), Status::Ok);
    let (_, read) = session.read(&key, &Bytes::default(), 4);
    assert_eq!(read, Some(longer));
}
