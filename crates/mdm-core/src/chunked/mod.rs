//! Long disk operations sliced into scheduler-sized steps.
//!
//! File allocation and integrity verification can each touch gigabytes. A
//! [`ResumableChunkedTask`] does one bounded slice per [`advance`] call so the
//! single scheduler thread keeps servicing sockets in between. A
//! [`TaskQueueManager`] lets only one such operation run at a time per queue.
//!
//! [`advance`]: ResumableChunkedTask::advance

mod allocation;
mod integrity;
mod queue;

pub use allocation::FileAllocationTask;
pub use integrity::IntegrityCheckTask;
pub use queue::TaskQueueManager;

use crate::error::DownloadError;

/// Which queue a chunked task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkedKind {
    FileAllocation,
    IntegrityCheck,
}

/// A disk operation driven incrementally. `0 <= current_length() <= total_length()`
/// and `is_done()` holds exactly when they are equal.
pub trait ResumableChunkedTask: std::fmt::Debug {
    fn kind(&self) -> ChunkedKind;

    /// Do one bounded step. A no-op once done. I/O failure is returned as a
    /// fatal error; the operation is not retried from where it stopped.
    fn advance(&mut self) -> Result<(), DownloadError>;

    fn is_done(&self) -> bool {
        self.current_length() == self.total_length()
    }

    fn current_length(&self) -> u64;

    fn total_length(&self) -> u64;

    /// Verdict once done. Allocation always passes; verification fails with
    /// `ChecksumFailed` on a digest mismatch.
    fn outcome(&self) -> Result<(), DownloadError> {
        Ok(())
    }
}
