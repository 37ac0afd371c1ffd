//! Default local-filesystem checkpoint backend.
//!
//! One directory per token under the base directory:
//!
//! ```text
//! <base>/<token>/index.dat     hash-bucket image
//! <base>/<token>/snapshot.dat  log snapshot (snapshot variant only)
//! <base>/<token>/info.dat      combined metadata (written last = commit)
//! <base>/<token>/commit.dat    per-session commit points
//! ```
//!
//! `info.dat` is the commit record: a directory without it is an aborted
//! checkpoint and is ignored by listing.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use super::{CheckpointManager, CheckpointSink, CheckpointToken};

pub struct LocalCheckpointManager {
    base_dir: PathBuf,
}

impl LocalCheckpointManager {
    pub fn new(base_dir: impl AsRef<Path>) -> io::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn token_dir(&self, token: CheckpointToken) -> PathBuf {
        self.base_dir.join(token.to_string())
    }

    fn write_file(&self, token: CheckpointToken, name: &str, bytes: &[u8]) -> io::Result<()> {
        let path = self.token_dir(token).join(name);
        let mut file = BufWriter::new(File::create(&path)?);
        file.write_all(bytes)?;
        file.flush()?;
        file.get_ref().sync_all()
    }

    fn read_file(&self, token: CheckpointToken, name: &str) -> io::Result<Vec<u8>> {
        let path = self.token_dir(token).join(name);
        let mut bytes = Vec::new();
        BufReader::new(File::open(&path)?).read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

impl CheckpointManager for LocalCheckpointManager {
    fn create(&self, token: CheckpointToken) -> io::Result<()> {
        fs::create_dir_all(self.token_dir(token))
    }

    fn commit_info(&self, token: CheckpointToken, bytes: &[u8]) -> io::Result<()> {
        self.write_file(token, "info.dat", bytes)
    }

    fn commit_points(&self, token: CheckpointToken, bytes: &[u8]) -> io::Result<()> {
        self.write_file(token, "commit.dat", bytes)
    }

    fn index_sink(&self, token: CheckpointToken) -> io::Result<Box<dyn CheckpointSink>> {
        let file = File::create(self.token_dir(token).join("index.dat"))?;
        Ok(Box::new(BufWriterSink::new(file)))
    }

    fn snapshot_sink(&self, token: CheckpointToken) -> io::Result<Box<dyn CheckpointSink>> {
        let file = File::create(self.token_dir(token).join("snapshot.dat"))?;
        Ok(Box::new(BufWriterSink::new(file)))
    }

    fn read_info(&self, token: CheckpointToken) -> io::Result<Vec<u8>> {
        self.read_file(token, "info.dat")
    }

    fn read_points(&self, token: CheckpointToken) -> io::Result<Vec<u8>> {
        self.read_file(token, "commit.dat")
    }

    fn index_source(&self, token: CheckpointToken) -> io::Result<Box<dyn Read + Send>> {
        let file = File::open(self.token_dir(token).join("index.dat"))?;
        Ok(Box::new(BufReader::with_capacity(1 << 20, file)))
    }

    fn snapshot_source(&self, token: CheckpointToken) -> io::Result<Box<dyn Read + Send>> {
        let file = File::open(self.token_dir(token).join("snapshot.dat"))?;
        Ok(Box::new(BufReader::with_capacity(1 << 20, file)))
    }

    fn list(&self) -> io::Result<Vec<CheckpointToken>> {
        let mut tokens = Vec::new();
        let entries = match fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(tokens),
            Err(err) => return Err(err),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Ok(token) = Uuid::parse_str(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if entry.path().join("info.dat").exists() {
                tokens.push(token);
            }
        }
        Ok(tokens)
    }

    fn remove(&self, token: CheckpointToken) -> io::Result<()> {
        fs::remove_dir_all(self.token_dir(token))
    }
}

/// Buffered, fsync-on-flush file sink.
struct BufWriterSink {
    inner: BufWriter<File>,
}

impl BufWriterSink {
    fn new(file: File) -> Self {
        Self {
            inner: BufWriter::with_capacity(1 << 20, file),
        }
    }
}

impl Write for BufWriterSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()?;
        self.inner.get_ref().sync_all()
    }
}

impl io::Seek for BufWriterSink {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointInfo, CheckpointKind};

    #[test]
    fn listing_requires_committed_info() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalCheckpointManager::new(dir.path()).unwrap();

        let committed = Uuid::new_v4();
        let aborted = Uuid::new_v4();
        manager.create(committed).unwrap();
        manager.create(aborted).unwrap();

        let info = CheckpointInfo {
            token: committed,
            kind: CheckpointKind::Full,
            sequence: 1,
            index: None,
            log: None,
        };
        manager
            .commit_info(committed, &info.to_json().unwrap())
            .unwrap();

        let listed = manager.list().unwrap();
        assert_eq!(listed, vec![committed]);
    }

    #[test]
    fn sink_and_source_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalCheckpointManager::new(dir.path()).unwrap();
        let token = Uuid::new_v4();
        manager.create(token).unwrap();

        {
            let mut sink = manager.index_sink(token).unwrap();
            sink.write_all(b"bucket image bytes").unwrap();
            sink.flush().unwrap();
        }
        let mut source = manager.index_source(token).unwrap();
        let mut bytes = Vec::new();
        source.read_to_end(&mut bytes).unwrap();
        assert_eq!(bytes, b"bucket image bytes");
    }

    #[test]
    fn remove_deletes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LocalCheckpointManager::new(dir.path()).unwrap();
        let token = Uuid::new_v4();
        manager.create(token).unwrap();
        manager.commit_points(token, b"{}").unwrap();
        manager.remove(token).unwrap();
        assert!(manager.read_points(token).is_err());
    }
}
