//! Bucket-array checkpoint image.
//!
//! `index.dat` layout (all little-endian u64 words):
//!
//! ```text
//! table_size | overflow_count | main buckets (8 words each) | overflow buckets
//! ```
//!
//! Overflow links are pool indexes, so the image is position independent and
//! can be restored into a freshly allocated pool.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::Ordering;

use crate::address::Address;

use super::bucket::{HashBucket, HashEntry, OverflowIndex};
use super::core::HashIndex;

impl HashIndex {
    /// Write the live table (main + overflow buckets) to `writer`.
    ///
    /// Read-cache entries must not be persisted — the cache is volatile —
    /// so `resolve_cache` maps a cache address to the main-log address its
    /// record shadows (`INVALID` drops the entry).
    ///
    /// Returns `(table_size, overflow_count, entry_count)`.
    pub fn write_snapshot<W: Write + Seek>(
        &self,
        writer: &mut W,
        resolve_cache: &dyn Fn(Address) -> Address,
    ) -> io::Result<(u64, u64, u64)> {
        let version = self.live_version();
        let table_size = self.tables[version].size();

        writer.write_all(&table_size.to_le_bytes())?;
        // Overflow count is patched at the end; buckets allocated while we
        // scan the main array are still captured by the later pool snapshot.
        writer.write_all(&0u64.to_le_bytes())?;

        let mut entries = 0u64;
        let mut write_bucket = |writer: &mut W, bucket: &HashBucket| -> io::Result<()> {
            for slot in &bucket.entries {
                let entry = slot.load(Ordering::Acquire);
                // Tentative entries are mid-insert; persist them as empty.
                let control = if entry.is_tentative() {
                    0
                } else if entry.in_read_cache() {
                    let main = resolve_cache(entry.address());
                    if main.is_invalid() {
                        0
                    } else {
                        HashEntry::new(main, entry.tag(), false).control()
                    }
                } else {
                    entry.control()
                };
                if control != 0 {
                    entries += 1;
                }
                writer.write_all(&control.to_le_bytes())?;
            }
            let overflow = bucket.overflow.load(Ordering::Acquire);
            writer.write_all(&overflow.control().to_le_bytes())?;
            Ok(())
        };

        for index in 0..table_size {
            write_bucket(writer, self.tables[version].bucket_at(index))?;
        }

        let overflow_snapshot = self.pools[version].snapshot();
        let overflow_count = overflow_snapshot.len() as u64;
        for ptr in overflow_snapshot {
            // SAFETY: pool pointers are stable until clear().
            write_bucket(writer, unsafe { &*ptr })?;
        }

        writer.flush()?;
        writer.seek(SeekFrom::Start(8))?;
        writer.write_all(&overflow_count.to_le_bytes())?;
        writer.flush()?;
        Ok((table_size, overflow_count, entries))
    }

    /// Restore the live table from a snapshot image.
    pub fn read_snapshot<R: Read>(&mut self, reader: &mut R) -> io::Result<()> {
        let mut word = [0u8; 8];

        reader.read_exact(&mut word)?;
        let table_size = u64::from_le_bytes(word);
        if !table_size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("snapshot table size {table_size} is not a power of two"),
            ));
        }
        reader.read_exact(&mut word)?;
        let overflow_count = u64::from_le_bytes(word);

        let version = self.live_version();
        self.tables[version].initialize(table_size);
        self.pools[version].resize_for_recovery(overflow_count as usize);

        let mut read_bucket = |reader: &mut R, bucket: &HashBucket| -> io::Result<()> {
            for slot in &bucket.entries {
                let mut word = [0u8; 8];
                reader.read_exact(&mut word)?;
                slot.store(
                    HashEntry::from_control(u64::from_le_bytes(word)),
                    Ordering::Release,
                );
            }
            let mut word = [0u8; 8];
            reader.read_exact(&mut word)?;
            bucket
                .overflow
                .store(OverflowIndex::new(u64::from_le_bytes(word)), Ordering::Release);
            Ok(())
        };

        for index in 0..table_size {
            read_bucket(reader, self.tables[version].bucket_at(index))?;
        }
        for index in 0..overflow_count {
            let link = OverflowIndex::new(index + 1);
            let ptr = self.pools[version].bucket_ptr(link).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "overflow bucket missing")
            })?;
            // SAFETY: freshly allocated pool bucket.
            read_bucket(reader, unsafe { &*ptr })?;
        }

        self.clear_tentative();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::index::KeyHash;
    use std::io::Cursor;

    #[test]
    fn snapshot_roundtrip_preserves_entries() {
        let index = HashIndex::new(8);
        let mut hashes = Vec::new();
        for i in 0..40u64 {
            let hash = KeyHash::new(((i + 1) << 48) | i);
            let slot = index.find_or_create_entry(hash);
            assert!(index.try_update_entry(&slot, Address::new(64 + i * 32), hash.tag()));
            hashes.push(hash);
        }

        let mut image = Cursor::new(Vec::new());
        let (table_size, overflow_count, entries) = index
            .write_snapshot(&mut image, &|_| Address::INVALID)
            .unwrap();
        assert_eq!(table_size, 8);
        assert!(overflow_count > 0, "40 entries in 8 buckets must overflow");
        assert_eq!(entries, 40);

        let mut restored = HashIndex::new(8);
        image.set_position(0);
        restored.read_snapshot(&mut image).unwrap();

        assert_eq!(restored.entry_count(), 40);
        for (i, hash) in hashes.iter().enumerate() {
            let found = restored.find_entry(*hash);
            assert!(found.found());
            assert_eq!(found.entry.address(), Address::new(64 + i as u64 * 32));
        }
    }

    #[test]
    fn snapshot_rejects_garbage_size() {
        let mut index = HashIndex::new(8);
        let mut image = Cursor::new(vec![0xFFu8; 16]);
        assert!(index.read_snapshot(&mut image).is_err());
    }
}
