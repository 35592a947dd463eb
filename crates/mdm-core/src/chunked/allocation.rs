use crate::config::FileAllocation;
use crate::error::DownloadError;
use crate::storage::StorageWriter;

use super::{ChunkedKind, ResumableChunkedTask};

/// Reserves file space up to `total` in `chunk`-sized steps.
///
/// Starts at the current on-disk length so bytes kept from an earlier run
/// are never overwritten.
#[derive(Debug)]
pub struct FileAllocationTask {
    storage: StorageWriter,
    mode: FileAllocation,
    offset: u64,
    total: u64,
    chunk: u64,
}

impl FileAllocationTask {
    pub fn new(
        storage: StorageWriter,
        total: u64,
        chunk: u64,
        mode: FileAllocation,
    ) -> Result<Self, DownloadError> {
        let offset = storage.len()?.min(total);
        Ok(Self {
            storage,
            mode,
            offset,
            total,
            chunk: chunk.max(1),
        })
    }
}

impl ResumableChunkedTask for FileAllocationTask {
    fn kind(&self) -> ChunkedKind {
        ChunkedKind::FileAllocation
    }

    fn advance(&mut self) -> Result<(), DownloadError> {
        if self.offset >= self.total {
            return Ok(());
        }
        let len = self.chunk.min(self.total - self.offset);
        self.storage.allocate_range(self.offset, len, self.mode)?;
        self.offset += len;
        if self.offset == self.total {
            tracing::debug!(total = self.total, mode = ?self.mode, "file allocation finished");
        }
        Ok(())
    }

    fn current_length(&self) -> u64 {
        self.offset
    }

    fn total_length(&self) -> u64 {
        self.total
    }
}
