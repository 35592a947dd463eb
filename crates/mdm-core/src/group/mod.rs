//! One logical download: a file fetched from one or more mirror URIs.
//!
//! A [`DownloadGroup`] owns everything about its file: the segment manager
//! (or a piece storage), the storage handle, and at most one chunked disk
//! operation. Tasks refer to a group by [`Gid`] only and look it up in the
//! registry on every invocation.

mod filename;
mod piece;
mod request;
mod result;
mod size;
mod stat;

pub use filename::{disposition_filename, output_filename};
pub use piece::{BitmapPieceStorage, PieceStorage};
pub use request::{DownloadRequest, GroupOptions};
pub use result::{DownloadResult, DownloadStat};
pub use size::SizeDecision;
pub use stat::{SpeedMeter, TransferStat, WorkerStat};

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::chunked::{IntegrityCheckTask, ResumableChunkedTask};
use crate::engine::{ConnectionTask, Task};
use crate::error::{DownloadError, ResultCode};
use crate::registry::Gid;
use crate::segmenter::{control_path, Segment, SegmentManager, WorkerId};
use crate::storage::StorageWriter;

#[derive(Debug)]
pub struct DownloadGroup {
    gid: Gid,
    uris: VecDeque<String>,
    failed_uris: Vec<String>,
    dir: PathBuf,
    out: Option<String>,
    path: Option<PathBuf>,
    options: GroupOptions,
    expected_sha256: Option<String>,

    segments: Option<SegmentManager>,
    piece_storage: Option<Box<dyn PieceStorage>>,
    storage: Option<StorageWriter>,
    chunked: Option<Box<dyn ResumableChunkedTask>>,
    verified: bool,
    finished_by_length: bool,
    /// Progress must not be persisted (verification failed).
    discard_progress: bool,
    workers_spawned: bool,
    next_worker: u64,

    connection_count: usize,
    task_refs: usize,
    file_not_found_count: u32,

    halt: bool,
    force_halt: bool,
    pause: bool,
    removal: bool,
    last_error: Option<DownloadError>,

    speed: SpeedMeter,
    workers: HashMap<WorkerId, WorkerStat>,
    started: Option<Instant>,
}

impl DownloadGroup {
    pub fn new(gid: Gid, request: DownloadRequest, options: GroupOptions) -> Self {
        Self {
            gid,
            uris: request.uris.into_iter().collect(),
            failed_uris: Vec::new(),
            dir: request.dir,
            out: request.out,
            path: None,
            options,
            expected_sha256: request.sha256.map(|s| s.to_ascii_lowercase()),
            segments: None,
            piece_storage: None,
            storage: None,
            chunked: None,
            verified: false,
            finished_by_length: false,
            discard_progress: false,
            workers_spawned: false,
            next_worker: 0,
            connection_count: 0,
            task_refs: 0,
            file_not_found_count: 0,
            halt: false,
            force_halt: false,
            pause: false,
            removal: false,
            last_error: None,
            speed: SpeedMeter::new(),
            workers: HashMap::new(),
            started: None,
        }
    }

    /// Attach piece-level tracking. Such a group gets its tasks from the peer
    /// layer; [`create_initial_task`](Self::create_initial_task) yields none.
    pub fn with_piece_storage(mut self, pieces: Box<dyn PieceStorage>) -> Self {
        self.piece_storage = Some(pieces);
        self
    }

    pub fn gid(&self) -> Gid {
        self.gid
    }

    pub fn uris(&self) -> impl Iterator<Item = &str> {
        self.uris.iter().map(String::as_str)
    }

    pub fn failed_uris(&self) -> &[String] {
        &self.failed_uris
    }

    /// Final path, once the filename is known.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn options(&self) -> &GroupOptions {
        &self.options
    }

    pub fn expected_sha256(&self) -> Option<&str> {
        self.expected_sha256.as_deref()
    }

    pub fn segments(&self) -> Option<&SegmentManager> {
        self.segments.as_ref()
    }

    pub fn segments_mut(&mut self) -> Option<&mut SegmentManager> {
        self.segments.as_mut()
    }

    pub fn piece_storage_mut(&mut self) -> Option<&mut (dyn PieceStorage + 'static)> {
        self.piece_storage.as_deref_mut()
    }

    pub fn storage(&self) -> Option<&StorageWriter> {
        self.storage.as_ref()
    }

    pub fn total_length(&self) -> Option<u64> {
        match &self.piece_storage {
            Some(p) => Some(p.total_length()),
            None => self.segments.as_ref().and_then(SegmentManager::total_length),
        }
    }

    pub fn completed_length(&self) -> u64 {
        match (&self.piece_storage, &self.segments) {
            (Some(p), _) => p.completed_length(),
            (None, Some(s)) => s.downloaded_length(),
            (None, None) => 0,
        }
    }

    /// Round-robin over the remaining URIs.
    pub fn next_uri(&mut self) -> Option<String> {
        let uri = self.uris.pop_front()?;
        self.uris.push_back(uri.clone());
        Some(uri)
    }

    /// Stop using `uri`; it is remembered as failed.
    pub fn drop_uri(&mut self, uri: &str) {
        let before = self.uris.len();
        self.uris.retain(|u| u != uri);
        if self.uris.len() != before {
            tracing::info!(gid = %self.gid, uri, remaining = self.uris.len(), "dropping URI");
            self.failed_uris.push(uri.to_string());
        }
    }

    pub fn has_uris(&self) -> bool {
        !self.uris.is_empty()
    }

    /// Reorder URIs; `key` ranks lower-is-better.
    pub fn sort_uris_by_key<K: Ord>(&mut self, key: impl FnMut(&String) -> K) {
        self.uris.make_contiguous().sort_by_key(key);
    }

    pub fn next_worker_id(&mut self) -> WorkerId {
        self.next_worker += 1;
        WorkerId(self.next_worker)
    }

    /// First negotiation Task, on the next URI. `None` for piece-storage
    /// groups and groups without URIs.
    pub fn create_initial_task(&mut self) -> Option<Box<dyn Task>> {
        if self.piece_storage.is_some() {
            return None;
        }
        let Some(uri) = self.next_uri() else {
            self.fail(DownloadError::abort(ResultCode::UnknownError, "no URI available"));
            return None;
        };
        self.started.get_or_insert_with(Instant::now);
        let worker = self.next_worker_id();
        Some(Box::new(ConnectionTask::negotiate(self.gid, worker, uri)))
    }

    /// Up to `n` transfer Tasks that go straight to segment acquisition.
    /// Only the first call per run yields tasks.
    pub fn create_transfer_tasks(&mut self, n: usize) -> Vec<Box<dyn Task>> {
        if self.workers_spawned || self.halt {
            return Vec::new();
        }
        self.workers_spawned = true;
        let mut tasks: Vec<Box<dyn Task>> = Vec::with_capacity(n);
        for _ in 0..n {
            let Some(uri) = self.next_uri() else { break };
            let worker = self.next_worker_id();
            tasks.push(Box::new(ConnectionTask::transfer(self.gid, worker, uri)));
        }
        tasks
    }

    /// How many more connections a fresh download may open beside the first.
    pub fn extra_connections(&self) -> usize {
        match &self.segments {
            Some(s) if s.is_bounded() && s.is_resumable() => {
                self.options.max_connections.min(s.segment_count()).saturating_sub(1)
            }
            _ => 0,
        }
    }

    /// Reject a server-reported length that contradicts the known one.
    pub fn validate_total_length(&self, observed: Option<u64>) -> Result<(), DownloadError> {
        match (self.total_length(), observed) {
            (Some(known), Some(seen)) if known != seen => Err(DownloadError::abort(
                ResultCode::UnknownError,
                format!("size mismatch: expected {known} bytes, server reports {seen}"),
            )),
            _ => Ok(()),
        }
    }

    /// Space must be reserved before transfers start.
    pub fn needs_file_allocation(&self) -> bool {
        if self.options.file_allocation == crate::config::FileAllocation::None {
            return false;
        }
        let Some(total) = self.segments.as_ref().and_then(SegmentManager::total_length) else {
            return false;
        };
        if total < self.options.no_file_allocation_limit {
            return false;
        }
        match &self.storage {
            Some(s) => s.len().map_or(true, |len| len < total),
            None => false,
        }
    }

    /// The final file already exists with the full length and no control
    /// file says it is partial. Never true when overwriting or verifying.
    pub fn download_finished_by_file_length(&self, total: Option<u64>) -> bool {
        if self.options.allow_overwrite || self.verification_required() {
            return false;
        }
        let (Some(path), Some(total)) = (&self.path, total) else {
            return false;
        };
        let on_disk = std::fs::metadata(path).map(|m| m.is_file() && m.len() == total);
        on_disk.unwrap_or(false) && !control_path(path).exists()
    }

    fn verification_required(&self) -> bool {
        self.options.check_integrity && self.expected_sha256.is_some()
    }

    /// All bytes committed and, when required, verified.
    pub fn download_finished(&self) -> bool {
        if self.finished_by_length {
            return true;
        }
        let complete = match (&self.piece_storage, &self.segments) {
            (Some(p), _) => p.download_finished(),
            (None, Some(s)) => s.is_finished(),
            (None, None) => false,
        };
        complete && (!self.verification_required() || self.verified)
    }

    /// Segments are all committed but the digest has not been checked.
    pub fn needs_verification(&self) -> bool {
        self.verification_required()
            && !self.verified
            && self.chunked.is_none()
            && self.segments.as_ref().is_some_and(SegmentManager::is_finished)
    }

    /// Install the integrity check as this group's chunked task.
    pub fn prepare_verification(&mut self) -> Result<(), DownloadError> {
        let (Some(storage), Some(total), Some(expected)) = (
            self.storage.clone(),
            self.total_length(),
            self.expected_sha256.clone(),
        ) else {
            return Err(DownloadError::fatal("nothing to verify"));
        };
        tracing::info!(gid = %self.gid, total, "verifying download");
        self.chunked = Some(Box::new(IntegrityCheckTask::new(
            storage,
            total,
            self.options.check_chunk_bytes,
            &expected,
        )));
        Ok(())
    }

    pub fn chunked_mut(&mut self) -> Option<&mut (dyn ResumableChunkedTask + 'static)> {
        self.chunked.as_deref_mut()
    }

    pub fn take_chunked(&mut self) -> Option<Box<dyn ResumableChunkedTask>> {
        self.chunked.take()
    }

    pub fn set_verified(&mut self) {
        tracing::info!(gid = %self.gid, "checksum verified");
        self.verified = true;
    }

    pub fn discard_progress(&mut self) {
        self.discard_progress = true;
    }

    pub fn connection_count(&self) -> usize {
        self.connection_count
    }

    /// Account a new transfer. Refused once halted.
    pub fn open_connection(&mut self) -> bool {
        if self.halt {
            return false;
        }
        self.connection_count += 1;
        true
    }

    pub fn close_connection(&mut self) {
        self.connection_count = self.connection_count.saturating_sub(1);
    }

    pub fn task_refs(&self) -> usize {
        self.task_refs
    }

    pub fn inc_task_refs(&mut self) {
        self.task_refs += 1;
    }

    pub fn dec_task_refs(&mut self) {
        self.task_refs = self.task_refs.saturating_sub(1);
    }

    /// Count a not-found response. True when the group should give up.
    pub fn record_file_not_found(&mut self) -> bool {
        self.file_not_found_count += 1;
        let max = self.options.max_file_not_found;
        max > 0 && self.file_not_found_count >= max
    }

    pub fn is_halt_requested(&self) -> bool {
        self.halt
    }

    pub fn is_force_halt_requested(&self) -> bool {
        self.force_halt
    }

    pub fn is_pause_requested(&self) -> bool {
        self.pause
    }

    pub fn is_removal_requested(&self) -> bool {
        self.removal
    }

    /// Halting clears a pending pause.
    pub fn set_halt_requested(&mut self, halt: bool) {
        self.halt = halt;
        if halt {
            self.pause = false;
            tracing::debug!(gid = %self.gid, "halt requested");
        }
    }

    /// Force halt implies halt.
    pub fn set_force_halt_requested(&mut self, force: bool) {
        self.force_halt = force;
        if force {
            self.set_halt_requested(true);
        }
    }

    pub fn set_pause_requested(&mut self, pause: bool) {
        self.pause = pause;
    }

    pub(crate) fn set_removal_requested(&mut self) {
        self.removal = true;
    }

    pub fn last_error(&self) -> Option<&DownloadError> {
        self.last_error.as_ref()
    }

    /// Record a terminal error and halt. The first error wins.
    pub fn fail(&mut self, err: DownloadError) {
        tracing::error!(gid = %self.gid, code = %err.code(), "download failed: {err}");
        if self.last_error.is_none() {
            self.last_error = Some(err);
        }
        self.set_halt_requested(true);
    }

    /// Keep `err` as the group's error without halting; other connections
    /// may still finish the download.
    pub fn record_error(&mut self, err: DownloadError) {
        if self.last_error.is_none() {
            self.last_error = Some(err);
        }
    }

    pub fn record_progress(&mut self, now: Instant, bytes: u64) {
        self.speed.record(now, bytes);
    }

    /// Start measuring `worker`; a no-op if it is measured already.
    pub fn start_worker(&mut self, worker: WorkerId, now: Instant) {
        self.workers
            .entry(worker)
            .or_insert_with(|| WorkerStat::new(now));
    }

    /// Progress of one connection; counts toward the group as well.
    pub fn record_worker_progress(&mut self, worker: WorkerId, now: Instant, bytes: u64) {
        self.record_progress(now, bytes);
        self.workers
            .entry(worker)
            .or_insert_with(|| WorkerStat::new(now))
            .record(now, bytes);
    }

    /// For a worker that found no free segment: take the segment of the
    /// slowest other connection, provided that one has run for at least the
    /// startup idle time and is below 80% of this worker's average speed.
    /// Written bytes are kept; the old owner's updates are dropped from now on.
    pub fn take_over_slow_segment(&mut self, worker: WorkerId, now: Instant) -> Option<Segment> {
        if !self.options.reassign_slow_segments {
            return None;
        }
        let threshold = self.workers.get(&worker)?.average_speed(now) * 8 / 10;
        let idle = self.options.startup_idle_time;
        let workers = &self.workers;
        let segments = self.segments.as_mut()?;
        let (slow_speed, slow) = segments
            .live_segments()
            .into_iter()
            .filter(|s| s.owner != worker)
            .filter_map(|s| {
                let stat = workers.get(&s.owner)?;
                (stat.elapsed(now) >= idle).then(|| (stat.speed(now), s))
            })
            .filter(|(speed, _)| *speed < threshold)
            .min_by_key(|(speed, _)| *speed)?;
        let segment = segments.reassign_segment(slow.index, worker)?;
        self.workers.remove(&slow.owner);
        tracing::info!(
            gid = %self.gid,
            slow = %slow.owner,
            slow_speed,
            worker = %worker,
            index = slow.index,
            "taking over segment of slow connection"
        );
        Some(segment)
    }

    pub fn stat(&self, now: Instant) -> TransferStat {
        TransferStat {
            download_speed: self.speed.speed(now),
            session_download_length: self.speed.session_bytes(),
            ..TransferStat::default()
        }
    }

    /// Result code: finished, then removed, then the recorded error, then
    /// halted as in-progress.
    pub fn result_code(&self) -> ResultCode {
        if self.download_finished() {
            ResultCode::Finished
        } else if self.removal {
            ResultCode::Removed
        } else if let Some(e) = &self.last_error {
            e.code()
        } else if self.halt {
            ResultCode::InProgress
        } else {
            ResultCode::UnknownError
        }
    }

    /// Persist resumable progress. No-op for finished or non-resumable groups.
    pub fn save_progress(&self) -> anyhow::Result<()> {
        if self.download_finished() || self.discard_progress {
            return Ok(());
        }
        match &self.segments {
            Some(s) => s.persist(),
            None => Ok(()),
        }
    }

    /// Release everything and report the outcome. Finished downloads are
    /// renamed into place; unfinished ones leave their control file behind.
    pub fn close(&mut self, now: Instant) -> DownloadResult {
        if let Err(e) = self.release_files() {
            self.fail(DownloadError::from(e));
        }
        let code = self.result_code();
        let message = match (&self.last_error, code.is_error()) {
            (Some(e), true) => e.message().to_string(),
            _ => String::new(),
        };
        tracing::info!(gid = %self.gid, code = %code, path = ?self.path, "download stopped");
        DownloadResult {
            gid: self.gid,
            code,
            message,
            path: self.path.clone(),
            uris: self.uris.iter().chain(&self.failed_uris).cloned().collect(),
            total_length: self.total_length(),
            completed_length: self.completed_length(),
            avg_speed: self.speed.average_speed(now),
            session_time: self.started.map(|s| now.saturating_duration_since(s)).unwrap_or_default(),
        }
    }

    fn release_files(&mut self) -> anyhow::Result<()> {
        let storage = self.storage.take();
        if self.download_finished() {
            if let (Some(storage), Some(path)) = (storage, &self.path) {
                storage.sync()?;
                storage.finalize(path)?;
            }
            if let Some(s) = &self.segments {
                s.remove_control_file()?;
            }
        } else if self.discard_progress {
            if let Some(s) = &self.segments {
                s.remove_control_file()?;
            }
        } else if let Some(s) = &self.segments {
            if let Some(storage) = &storage {
                storage.sync()?;
            }
            s.persist()?;
        }
        Ok(())
    }

    /// Back to a waiting state after a pause: progress is saved, runtime
    /// state dropped. URIs and the pause flag are kept.
    pub fn reset_for_requeue(&mut self) {
        if let Err(e) = self.save_progress() {
            tracing::warn!(gid = %self.gid, "saving progress before requeue failed: {e:#}");
        }
        self.segments = None;
        self.storage = None;
        self.chunked = None;
        self.verified = false;
        self.finished_by_length = false;
        self.workers_spawned = false;
        self.connection_count = 0;
        self.task_refs = 0;
        self.file_not_found_count = 0;
        self.halt = false;
        self.force_halt = false;
        self.last_error = None;
        self.speed.reset();
        self.workers.clear();
        tracing::debug!(gid = %self.gid, "group reset for requeue");
    }
}

#[cfg(test)]
mod tests;
