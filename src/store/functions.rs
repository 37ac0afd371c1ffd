//! User callback bundle: how the store reads, writes, and updates values.
//!
//! One `StoreFunctions` implementation is attached to a store at
//! construction. Readers produce an `Output` from a stored value; updaters
//! implement RMW. The `concurrent_*` variants run against records in the
//! mutable region, potentially racing other sessions — implementations that
//! cannot tolerate that return `false` to force the append path.

use uuid::Uuid;

use crate::codec::{StoreKey, StoreValue};
use crate::status::Status;

/// The callback bundle.
pub trait StoreFunctions<K, V>: Send + Sync + 'static
where
    K: StoreKey,
    V: StoreValue,
{
    /// RMW input (e.g. an increment amount).
    type Input: Clone + Send + Sync + 'static;
    /// What reads return.
    type Output: Send + 'static;

    /// Read a value no other session can be mutating.
    fn single_reader(&self, key: &K, input: &Self::Input, value: &V) -> Self::Output;

    /// Read a value that concurrent sessions may be updating in place.
    fn concurrent_reader(&self, key: &K, input: &Self::Input, value: &V) -> Self::Output {
        self.single_reader(key, input, value)
    }

    /// Produce the stored value for an upsert into a fresh record.
    fn single_writer(&self, _key: &K, src: &V) -> V {
        src.clone()
    }

    /// Overwrite `dst` in place with `src`; return `false` to refuse and
    /// force a fresh record instead.
    fn concurrent_writer(&self, _key: &K, src: &V, dst: &mut V) -> bool {
        *dst = src.clone();
        true
    }

    /// Value for an RMW on an absent key.
    fn initial_updater(&self, key: &K, input: &Self::Input) -> V;

    /// Value for an RMW over an existing, immutable record.
    fn copy_updater(&self, key: &K, input: &Self::Input, old: &V) -> V;

    /// RMW in place; return `false` to refuse and force copy-update.
    fn in_place_updater(&self, key: &K, input: &Self::Input, value: &mut V) -> bool {
        *value = self.copy_updater(key, input, value);
        true
    }

    /// A read that went pending has completed.
    fn read_completed(
        &self,
        _key: &K,
        _serial: u64,
        _status: Status,
        _output: Option<Self::Output>,
    ) {
    }

    /// An RMW that went pending has completed.
    fn rmw_completed(&self, _key: &K, _serial: u64, _status: Status) {}

    /// A checkpoint covering this session committed; `serial` is the
    /// session's recovery barrier.
    fn checkpoint_completed(&self, _guid: Uuid, _serial: u64) {}
}

/// Plain overwrite semantics: RMW input is the value itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct OverwriteFunctions;

impl<K, V> StoreFunctions<K, V> for OverwriteFunctions
where
    K: StoreKey,
    V: StoreValue,
{
    type Input = V;
    type Output = V;

    fn single_reader(&self, _key: &K, _input: &V, value: &V) -> V {
        value.clone()
    }

    fn initial_updater(&self, _key: &K, input: &V) -> V {
        input.clone()
    }

    fn copy_updater(&self, _key: &K, input: &V, _old: &V) -> V {
        input.clone()
    }
}

/// Saturating-add semantics over `u64` values; the canonical RMW example.
#[derive(Debug, Default, Clone, Copy)]
pub struct AddFunctions;

impl<K> StoreFunctions<K, u64> for AddFunctions
where
    K: StoreKey,
{
    type Input = u64;
    type Output = u64;

    fn single_reader(&self, _key: &K, _input: &u64, value: &u64) -> u64 {
        *value
    }

    fn initial_updater(&self, _key: &K, input: &u64) -> u64 {
        *input
    }

    fn copy_updater(&self, _key: &K, input: &u64, old: &u64) -> u64 {
        old.saturating_add(*input)
    }

    fn in_place_updater(&self, _key: &K, input: &u64, value: &mut u64) -> bool {
        *value = value.saturating_add(*input);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_semantics() {
        let f = OverwriteFunctions;
        assert_eq!(
            StoreFunctions::<u64, u64>::initial_updater(&f, &1, &42),
            42
        );
        assert_eq!(
            StoreFunctions::<u64, u64>::copy_updater(&f, &1, &42, &7),
            42
        );
    }

    #[test]
    fn add_semantics() {
        let f = AddFunctions;
        assert_eq!(StoreFunctions::<u64, u64>::initial_updater(&f, &1, &5), 5);
        assert_eq!(StoreFunctions::<u64, u64>::copy_updater(&f, &1, &5, &10), 15);
        let mut value = 10;
        assert!(StoreFunctions::<u64, u64>::in_place_updater(
            &f, &1, &5, &mut value
        ));
        assert_eq!(value, 15);
    }
}
