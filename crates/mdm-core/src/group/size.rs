use std::path::Path;

use crate::chunked::FileAllocationTask;
use crate::error::{DownloadError, ResultCode};
use crate::segmenter::{control_path, LoadOutcome, SegmentManager};
use crate::storage::{temp_path, StorageWriter};

use super::{output_filename, DownloadGroup};

/// What the negotiation layer does once the file size is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeDecision {
    StartFresh,
    /// Earlier progress was restored (or the size was already known).
    Resume,
    /// Nothing to download.
    AlreadyComplete,
    /// Space must be reserved before any transfer; the allocation task is
    /// installed on the group.
    NeedsAllocation,
    /// The target already exists; its digest is checked instead of
    /// downloading. The integrity check is installed on the group.
    NeedsVerification,
}

impl DownloadGroup {
    /// Fix the output path from `out`, the server's filename, or the URI.
    /// Once known, the path never changes.
    pub fn resolve_path(&mut self, uri: &str, content_disposition: Option<&str>) -> &Path {
        let dir = &self.dir;
        let out = self.out.as_deref();
        self.path
            .get_or_insert_with(|| dir.join(output_filename(out, content_disposition, uri)))
            .as_path()
    }

    /// True until the first call to
    /// [`on_file_size_determined`](Self::on_file_size_determined) succeeded.
    pub fn is_size_pending(&self) -> bool {
        self.segments.is_none() && self.piece_storage.is_none()
    }

    /// Called by the negotiation layer with what the server reported.
    ///
    /// The first call fixes the filename, builds the segment manager and
    /// opens storage, restoring progress from a control file when one
    /// matches. Later calls (another mirror) only validate the length.
    pub fn on_file_size_determined(
        &mut self,
        uri: &str,
        total: Option<u64>,
        accept_ranges: bool,
        content_disposition: Option<&str>,
    ) -> Result<SizeDecision, DownloadError> {
        if !self.is_size_pending() {
            self.validate_total_length(total)?;
            return Ok(SizeDecision::Resume);
        }

        let path = self.resolve_path(uri, content_disposition).to_path_buf();

        if self.download_finished_by_file_length(total) {
            tracing::info!(gid = %self.gid, path = %path.display(), "file already complete, skipping");
            let mut segments = SegmentManager::new(total.unwrap_or(0), self.options.segment_size);
            segments.mark_all_complete();
            self.segments = Some(segments);
            self.finished_by_length = true;
            return Ok(SizeDecision::AlreadyComplete);
        }
        if path.exists() && !self.options.allow_overwrite {
            if let Some(total) = total.filter(|&t| self.can_verify_existing(&path, t)) {
                return self.verify_existing_file(&path, total);
            }
            return Err(DownloadError::abort(
                ResultCode::UnknownError,
                format!("file already exists: {}", path.display()),
            ));
        }

        let segments = match total {
            Some(len) if accept_ranges => SegmentManager::new(len, self.options.segment_size),
            Some(len) => SegmentManager::single(len),
            None => SegmentManager::unbounded(),
        };
        let mut segments = segments.with_control_file(control_path(&path));

        let temp = temp_path(&path);
        let resumed = match part_length(&temp) {
            Some(len) => matches!(segments.load_against(Some(len)), LoadOutcome::Resumed { .. }),
            None => false,
        };
        let storage = if resumed {
            StorageWriter::open_existing(&temp)?
        } else {
            segments.reset();
            StorageWriter::create(&temp)?
        };
        tracing::info!(
            gid = %self.gid,
            path = %path.display(),
            total = ?total,
            accept_ranges,
            resumed,
            "file size determined"
        );
        self.segments = Some(segments);
        self.storage = Some(storage.clone());

        if self.needs_file_allocation() {
            if let Some(total) = total {
                self.chunked = Some(Box::new(FileAllocationTask::new(
                    storage,
                    total,
                    self.options.allocation_chunk_bytes,
                    self.options.file_allocation,
                )?));
                return Ok(SizeDecision::NeedsAllocation);
            }
        }
        Ok(if resumed {
            SizeDecision::Resume
        } else {
            SizeDecision::StartFresh
        })
    }

    /// An existing target of the full length, with no control file marking
    /// it partial, can be checked against the expected digest.
    fn can_verify_existing(&self, path: &Path, total: u64) -> bool {
        if !self.verification_required() || control_path(path).exists() {
            return false;
        }
        std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() == total)
    }

    /// Treat the existing target as fully downloaded and hash it in place.
    /// A mismatch fails the group and leaves the file untouched.
    fn verify_existing_file(&mut self, path: &Path, total: u64) -> Result<SizeDecision, DownloadError> {
        tracing::info!(gid = %self.gid, path = %path.display(), "file exists, checking it against the digest");
        let storage = StorageWriter::open_existing(path)?;
        let mut segments = SegmentManager::new(total, self.options.segment_size);
        segments.mark_all_complete();
        self.segments = Some(segments);
        self.storage = Some(storage);
        self.prepare_verification()?;
        Ok(SizeDecision::NeedsVerification)
    }
}

/// Length of an existing `.part` file. `None` if it is missing or not a
/// regular file.
fn part_length(temp: &Path) -> Option<u64> {
    std::fs::metadata(temp)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}
