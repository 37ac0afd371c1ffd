//! Read-modify-write semantics, including the concurrent counter law.

use std::sync::Arc;
use std::thread;

use tidekv::{AddFunctions, NullDevice, Status, StoreSettings, TideKv};

type Store = TideKv<u64, u64, AddFunctions, NullDevice>;

fn create_store() -> Arc<Store> {
    let mut settings = StoreSettings::new(1 << 10);
    settings.log.page_bits = 14;
    settings.log.memory_bits = 22;
    Arc::new(TideKv::new(settings, AddFunctions, Arc::new(NullDevice::new())).unwrap())
}

#[test]
fn rmw_on_absent_key_uses_initial_updater() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    assert_eq!(session.rmw(&1, &5, 1), Status::Ok);
    assert_eq!(session.read(&1, &0, 2), (Status::Ok, Some(5)));
}

#[test]
fn rmw_accumulates() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    for serial in 1..=10 {
        assert_eq!(session.rmw(&1, &3, serial), Status::Ok);
    }
    assert_eq!(session.read(&1, &0, 11), (Status::Ok, Some(30)));
}

#[test]
fn rmw_matches_upsert_of_initial_value() {
    // RMW on an absent key behaves like upserting initial_updater(input).
    let store = create_store();
    let mut session = store.start_session().unwrap();

    session.rmw(&1, &7, 1);
    session.upsert(&2, &7, 2);

    assert_eq!(session.read(&1, &0, 3), session.read(&2, &0, 4));
}

#[test]
fn rmw_after_delete_reinitialises() {
    let store = create_store();
    let mut session = store.start_session().unwrap();

    session.rmw(&1, &10, 1);
    session.delete(&1, 2);
    session.rmw(&1, &4, 3);
    assert_eq!(session.read(&1, &0, 4), (Status::Ok, Some(4)));
}

#[test]
fn concurrent_rmw_totals_exactly() {
    // 10 threads, 100 increments of +5 each on one key: the final value
    // must be exactly 5000 regardless of interleaving.
    let store = create_store();
    let threads: Vec<_> = (0..10)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                let mut session = store.start_session().unwrap();
                for i in 0..100u64 {
                    let serial = t * 1000 + i + 1;
                    let status = session.rmw(&42, &5, serial);
                    assert!(
                        status == Status::Ok,
                        "rmw returned {status:?} on thread {t}"
                    );
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let mut session = store.start_session().unwrap();
    assert_eq!(session.read(&42, &0, 1), (Status::Ok, Some(5000)));
}

#[test]
fn concurrent_upserts_distinct_keys() {
    let store = create_store();
    let threads: Vec<_> = (0..8u64)
        .map(|t| {
            let store = store.clone();
            thread::spawn(move || {
                let mut session = store.start_session().unwrap();
                for i in 0..500u64 {
                    let key = t * 1000 + i;
                    assert_eq!(session.upsert(&key, &(key * 2), i + 1), Status::Ok);
                }
            })
        })
        .collect();
    for thread in threads {
        thread.join().unwrap();
    }

    let mut session = store.start_session().unwrap();
    let mut serial = 0;
    for t in 0..8u64 {
        for i in 0..500u64 {
            let key = t * 1000 + i;
            serial += 1;
            assert_eq!(session.read(&key, &0, serial), (Status::Ok, Some(key * 2)));
        }
    }
    assert_eq!(store.entry_count(), 8 * 500);
}
