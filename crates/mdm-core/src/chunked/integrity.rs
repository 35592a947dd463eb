use sha2::{Digest, Sha256};

use crate::error::{DownloadError, ResultCode};
use crate::storage::StorageWriter;

use super::{ChunkedKind, ResumableChunkedTask};

/// Hashes the downloaded file with SHA-256, `chunk` bytes per step, and
/// compares against the expected digest at the end.
pub struct IntegrityCheckTask {
    storage: StorageWriter,
    expected: String,
    hasher: Sha256,
    offset: u64,
    total: u64,
    buf: Vec<u8>,
    actual: Option<String>,
}

impl std::fmt::Debug for IntegrityCheckTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntegrityCheckTask")
            .field("storage", &self.storage)
            .field("offset", &self.offset)
            .field("total", &self.total)
            .field("actual", &self.actual)
            .finish()
    }
}

impl IntegrityCheckTask {
    /// `expected` is lowercase or uppercase hex.
    pub fn new(storage: StorageWriter, total: u64, chunk: u64, expected: &str) -> Self {
        let mut task = Self {
            storage,
            expected: expected.to_ascii_lowercase(),
            hasher: Sha256::new(),
            offset: 0,
            total,
            buf: vec![0u8; chunk.clamp(1, 16 * 1024 * 1024) as usize],
            actual: None,
        };
        if total == 0 {
            task.finish();
        }
        task
    }

    /// Hex digest of the whole file, once hashed.
    pub fn actual(&self) -> Option<&str> {
        self.actual.as_deref()
    }

    fn finish(&mut self) {
        let digest = std::mem::take(&mut self.hasher).finalize();
        self.actual = Some(hex::encode(digest));
    }
}

impl ResumableChunkedTask for IntegrityCheckTask {
    fn kind(&self) -> ChunkedKind {
        ChunkedKind::IntegrityCheck
    }

    fn advance(&mut self) -> Result<(), DownloadError> {
        if self.actual.is_some() {
            return Ok(());
        }
        if self.offset < self.total {
            let want = (self.total - self.offset).min(self.buf.len() as u64) as usize;
            let n = self.storage.read_at(self.offset, &mut self.buf[..want])?;
            if n == 0 {
                return Err(DownloadError::fatal(format!(
                    "unexpected end of file at {} of {}",
                    self.offset, self.total
                )));
            }
            self.hasher.update(&self.buf[..n]);
            self.offset += n as u64;
        }
        if self.offset == self.total {
            self.finish();
        }
        Ok(())
    }

    fn current_length(&self) -> u64 {
        self.offset
    }

    fn total_length(&self) -> u64 {
        self.total
    }

    fn outcome(&self) -> Result<(), DownloadError> {
        match &self.actual {
            Some(actual) if *actual == self.expected => Ok(()),
            Some(actual) => Err(DownloadError::abort(
                ResultCode::ChecksumFailed,
                format!("checksum mismatch: expected {}, got {actual}", self.expected),
            )),
            None => Err(DownloadError::fatal("integrity check not finished")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_SHA256: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    fn storage_with(content: &[u8]) -> (tempfile::TempDir, StorageWriter) {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageWriter::create(&dir.path().join("c.part")).unwrap();
        storage.write_at(0, content).unwrap();
        (dir, storage)
    }

    #[test]
    fn matching_digest_passes() {
        let (_dir, storage) = storage_with(b"hello\n");
        let mut task = IntegrityCheckTask::new(storage, 6, 4, &HELLO_SHA256.to_uppercase());
        task.advance().unwrap();
        assert_eq!(task.current_length(), 4);
        assert!(!task.is_done());
        task.advance().unwrap();
        assert!(task.is_done());
        assert_eq!(task.actual(), Some(HELLO_SHA256));
        assert!(task.outcome().is_ok());
    }

    #[test]
    fn mismatch_is_checksum_failure() {
        let (_dir, storage) = storage_with(b"hellO\n");
        let mut task = IntegrityCheckTask::new(storage, 6, 1024, HELLO_SHA256);
        task.advance().unwrap();
        assert!(task.is_done());
        let err = task.outcome().unwrap_err();
        assert_eq!(err.code(), ResultCode::ChecksumFailed);
    }

    #[test]
    fn advance_after_done_changes_nothing() {
        let (_dir, storage) = storage_with(b"hello\n");
        let mut task = IntegrityCheckTask::new(storage, 6, 1024, HELLO_SHA256);
        task.advance().unwrap();
        let before = (task.current_length(), task.actual().map(str::to_string));
        task.advance().unwrap();
        task.advance().unwrap();
        assert_eq!((task.current_length(), task.actual().map(str::to_string)), before);
    }

    #[test]
    fn empty_file_is_done_immediately() {
        let (_dir, storage) = storage_with(b"");
        let mut task = IntegrityCheckTask::new(
            storage,
            0,
            1024,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        );
        assert!(task.is_done());
        task.advance().unwrap();
        assert!(task.outcome().is_ok());
    }

    #[test]
    fn short_file_is_fatal() {
        let (_dir, storage) = storage_with(b"abc");
        let mut task = IntegrityCheckTask::new(storage, 10, 1024, HELLO_SHA256);
        task.advance().unwrap();
        let err = task.advance().unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Fatal);
    }
}
