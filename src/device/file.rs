//! Segmented file device.
//!
//! The logical address space is split into segments of `1 << segment_bits`
//! bytes, each a file `<prefix>.<n>` under one directory. Segments are
//! created lazily on first write and deleted wholesale by `remove_below`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::utility::is_power_of_two;

use super::SyncDevice;

pub struct SegmentedDisk {
    dir: PathBuf,
    prefix: String,
    segment_bits: u32,
    segments: Mutex<Vec<Option<File>>>,
}

impl SegmentedDisk {
    /// Open (or create) a segmented device under `dir`.
    pub fn open(dir: impl AsRef<Path>, prefix: &str, segment_bits: u32) -> io::Result<Self> {
        assert!(is_power_of_two(1u64 << segment_bits));
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            prefix: prefix.to_string(),
            segment_bits,
            segments: Mutex::new(Vec::new()),
        })
    }

    /// Size of one segment in bytes.
    pub fn segment_size(&self) -> u64 {
        1 << self.segment_bits
    }

    fn segment_path(&self, segment: u64) -> PathBuf {
        self.dir.join(format!("{}.{}", self.prefix, segment))
    }

    fn with_segment<R>(
        &self,
        segment: u64,
        create: bool,
        f: impl FnOnce(&mut File) -> io::Result<R>,
    ) -> io::Result<Option<R>> {
        let mut segments = self.segments.lock();
        if segments.len() <= segment as usize {
            segments.resize_with(segment as usize + 1, || None);
        }
        if segments[segment as usize].is_none() {
            let path = self.segment_path(segment);
            if !create && !path.exists() {
                return Ok(None);
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(create)
                .open(&path)?;
            segments[segment as usize] = Some(file);
        }
        let file = segments[segment as usize].as_mut().expect("segment open");
        f(file).map(Some)
    }

    /// Split an I/O spanning segments into per-segment ranges.
    fn for_each_range(
        &self,
        offset: u64,
        len: usize,
        mut f: impl FnMut(u64, u64, usize, usize) -> io::Result<()>,
    ) -> io::Result<()> {
        let segment_size = self.segment_size();
        let mut remaining = len;
        let mut cursor = offset;
        let mut buf_pos = 0usize;
        while remaining > 0 {
            let segment = cursor >> self.segment_bits;
            let in_segment = cursor & (segment_size - 1);
            let chunk = ((segment_size - in_segment) as usize).min(remaining);
            f(segment, in_segment, buf_pos, chunk)?;
            cursor += chunk as u64;
            buf_pos += chunk;
            remaining -= chunk;
        }
        Ok(())
    }
}

impl SyncDevice for SegmentedDisk {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len();
        self.for_each_range(offset, len, |segment, in_segment, buf_pos, chunk| {
            let read = self.with_segment(segment, false, |file| {
                file.seek(SeekFrom::Start(in_segment))?;
                let mut done = 0;
                while done < chunk {
                    match file.read(&mut buf[buf_pos + done..buf_pos + chunk])? {
                        0 => break,
                        n => done += n,
                    }
                }
                Ok(done)
            })?;
            match read {
                // Missing or short segment: the remainder was never written;
                // surface zeroes like a sparse file would.
                None => buf[buf_pos..buf_pos + chunk].fill(0),
                Some(done) if done < chunk => buf[buf_pos + done..buf_pos + chunk].fill(0),
                Some(_) => {}
            }
            Ok(())
        })?;
        Ok(len)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.for_each_range(offset, buf.len(), |segment, in_segment, buf_pos, chunk| {
            self.with_segment(segment, true, |file| {
                file.seek(SeekFrom::Start(in_segment))?;
                file.write_all(&buf[buf_pos..buf_pos + chunk])
            })?;
            Ok(())
        })
    }

    fn sync(&self) -> io::Result<()> {
        let segments = self.segments.lock();
        for file in segments.iter().flatten() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn remove_below(&self, offset: u64) -> io::Result<()> {
        let boundary_segment = offset >> self.segment_bits;
        let mut segments = self.segments.lock();
        for segment in 0..boundary_segment.min(segments.len() as u64) {
            segments[segment as usize] = None;
        }
        // Also unlink files from earlier runs that were never opened here.
        for segment in 0..boundary_segment {
            let path = self.segment_path(segment);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_roundtrip_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        // 1 KiB segments force the write below to straddle a boundary.
        let disk = SegmentedDisk::open(dir.path(), "log", 10).unwrap();

        let data: Vec<u8> = (0..2048).map(|i| (i % 251) as u8).collect();
        disk.write_at(512, &data).unwrap();

        let mut out = vec![0u8; 2048];
        disk.read_at(512, &mut out).unwrap();
        assert_eq!(out, data);
        assert!(dir.path().join("log.0").exists());
        assert!(dir.path().join("log.1").exists());
        assert!(dir.path().join("log.2").exists());
    }

    #[test]
    fn unwritten_ranges_read_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let disk = SegmentedDisk::open(dir.path(), "log", 12).unwrap();
        let mut buf = [0xFFu8; 64];
        disk.read_at(1 << 20, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
    }

    #[test]
    fn remove_below_deletes_whole_segments() {
        let dir = tempfile::tempdir().unwrap();
        let disk = SegmentedDisk::open(dir.path(), "log", 10).unwrap();
        disk.write_at(0, &[1u8; 1024]).unwrap();
        disk.write_at(1024, &[2u8; 1024]).unwrap();
        disk.write_at(2048, &[3u8; 1024]).unwrap();

        disk.remove_below(2048).unwrap();
        assert!(!dir.path().join("log.0").exists());
        assert!(!dir.path().join("log.1").exists());
        assert!(dir.path().join("log.2").exists());
    }
}
