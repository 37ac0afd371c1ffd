//! Storage devices backing the on-disk portion of the hybrid log.
//!
//! A device is addressed by the log's logical byte offsets; segmented
//! implementations split that space into fixed-size segment files so old
//! prefixes can be dropped by deleting whole segments.

mod file;
mod null;

pub use file::SegmentedDisk;
pub use null::NullDevice;

use std::io;

/// Synchronous block-device contract.
///
/// The store performs asynchronous I/O by submitting requests to its
/// background worker, which calls these methods; implementations only need
/// to be thread-safe, not async.
pub trait SyncDevice: Send + Sync + 'static {
    /// Read `buf.len()` bytes at `offset`. Short reads return the count.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf` at `offset`.
    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Flush buffered writes to stable storage.
    fn sync(&self) -> io::Result<()>;

    /// Drop storage wholly below `offset` (log truncation). Best effort.
    fn remove_below(&self, offset: u64) -> io::Result<()> {
        let _ = offset;
        Ok(())
    }

    /// Sector size for alignment-sensitive callers.
    fn sector_size(&self) -> usize {
        512
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_device_reads_zeroes() {
        let device = NullDevice::new();
        device.write_at(0, b"discarded").unwrap();
        let mut buf = [0xAAu8; 8];
        let n = device.read_at(0, &mut buf).unwrap();
        assert_eq!(n, 8);
        assert_eq!(buf, [0u8; 8]);
    }
}
