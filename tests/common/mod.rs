//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use tidekv::codec::StoreKey;
use tidekv::{Status, StoreFunctions};

/// Captured completion events, shared between the store and the test body.
#[derive(Default)]
pub struct Capture {
    pub completed_reads: Mutex<Vec<(u64, Status, Option<u64>)>>,
    pub completed_rmws: Mutex<Vec<(u64, Status)>>,
}

impl Capture {
    pub fn read_result(&self, serial: u64) -> Option<(Status, Option<u64>)> {
        self.completed_reads
            .lock()
            .iter()
            .find(|(s, _, _)| *s == serial)
            .map(|(_, status, output)| (*status, *output))
    }
}

/// Add-style functions over `u64` values that record pending completions so
/// tests can observe results delivered through `complete_pending`.
#[derive(Default, Clone)]
pub struct CapturingFunctions(pub Arc<Capture>);

impl<K: StoreKey> StoreFunctions<K, u64> for CapturingFunctions {
    type Input = u64;
    type Output = u64;

    fn single_reader(&self, _key: &K, _input: &u64, value: &u64) -> u64 {
        *value
    }

    fn initial_updater(&self, _key: &K, input: &u64) -> u64 {
        *input
    }

    fn copy_updater(&self, _key: &K, input: &u64, old: &u64) -> u64 {
        old.wrapping_add(*input)
    }

    fn in_place_updater(&self, _key: &K, input: &u64, value: &mut u64) -> bool {
        *value = value.wrapping_add(*input);
        true
    }

    fn read_completed(&self, _key: &K, serial: u64, status: Status, output: Option<u64>) {
        self.0.completed_reads.lock().push((serial, status, output));
    }

    fn rmw_completed(&self, _key: &K, serial: u64, status: Status) {
        self.0.completed_rmws.lock().push((serial, status));
    }
}
