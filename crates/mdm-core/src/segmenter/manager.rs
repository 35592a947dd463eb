use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::bitmap::SegmentBitmap;
use super::segment::{Segment, WorkerId};

/// Progress of a segment that is checked out or partially written.
#[derive(Debug, Clone, Copy)]
pub(super) struct Entry {
    pub(super) written: u64,
    pub(super) owner: Option<WorkerId>,
    pub(super) generation: u64,
}

/// Partitions one file into segments and lends them to workers.
///
/// Segment `i` covers `[i * segment_length, min((i + 1) * segment_length, total))`.
/// `in_use` marks checked-out segments, `completed` committed ones; the two
/// never overlap. When resumable, a cancelled segment keeps its written
/// bytes so the next worker continues after them.
#[derive(Debug)]
pub struct SegmentManager {
    pub(super) total_length: Option<u64>,
    pub(super) segment_length: u64,
    pub(super) completed: SegmentBitmap,
    in_use: SegmentBitmap,
    pub(super) entries: BTreeMap<usize, Entry>,
    generation: u64,
    /// Partial progress survives cancel and restart (the source honours ranges).
    resumable: bool,
    pub(super) control_path: Option<PathBuf>,
}

impl SegmentManager {
    /// Manager for a file of known length. A zero `segment_length` is treated as 1.
    pub fn new(total_length: u64, segment_length: u64) -> Self {
        let segment_length = segment_length.max(1);
        let count = total_length.div_ceil(segment_length) as usize;
        Self {
            total_length: Some(total_length),
            segment_length,
            completed: SegmentBitmap::new(count),
            in_use: SegmentBitmap::new(count),
            entries: BTreeMap::new(),
            generation: 0,
            resumable: true,
            control_path: None,
        }
    }

    /// One segment spanning the whole file, restarted from zero when
    /// released. For sources that ignore range requests.
    pub fn single(total_length: u64) -> Self {
        let mut manager = Self::new(total_length, total_length);
        manager.resumable = false;
        manager
    }

    /// Manager for a stream of unknown length: a single open-ended segment.
    pub fn unbounded() -> Self {
        Self {
            total_length: None,
            segment_length: 0,
            completed: SegmentBitmap::new(1),
            in_use: SegmentBitmap::new(1),
            entries: BTreeMap::new(),
            generation: 0,
            resumable: false,
            control_path: None,
        }
    }

    pub fn with_control_file(mut self, path: PathBuf) -> Self {
        self.control_path = Some(path);
        self
    }

    pub fn control_path(&self) -> Option<&Path> {
        self.control_path.as_deref()
    }

    pub fn total_length(&self) -> Option<u64> {
        self.total_length
    }

    pub fn segment_length(&self) -> u64 {
        self.segment_length
    }

    pub fn is_bounded(&self) -> bool {
        self.total_length.is_some() && self.segment_length > 0
    }

    pub fn is_resumable(&self) -> bool {
        self.resumable
    }

    pub fn segment_count(&self) -> usize {
        match self.total_length {
            Some(total) if self.segment_length > 0 => total.div_ceil(self.segment_length) as usize,
            // learned length of a finished stream, or unknown length
            Some(_) | None => 1,
        }
    }

    /// `(start, length)` of segment `index`.
    pub(super) fn bounds(&self, index: usize) -> (u64, Option<u64>) {
        match self.total_length {
            Some(total) if self.segment_length > 0 => {
                let start = index as u64 * self.segment_length;
                let end = (start + self.segment_length).min(total);
                (start, Some(end.saturating_sub(start)))
            }
            Some(total) => (0, Some(total)),
            None => (0, None),
        }
    }

    fn segment_from(&self, index: usize, entry: &Entry, owner: WorkerId) -> Segment {
        let (start, length) = self.bounds(index);
        Segment {
            index,
            start,
            length,
            written: entry.written,
            owner,
            generation: entry.generation,
        }
    }

    /// Check out the lowest-offset segment that is neither committed nor owned.
    ///
    /// A worker that already owns a segment gets the same one back. A
    /// previously cancelled segment is handed out with its written bytes, so
    /// the new owner starts at [`Segment::position`].
    pub fn request_segment(&mut self, worker: WorkerId) -> Option<Segment> {
        if let Some((&index, entry)) = self
            .entries
            .iter()
            .find(|(_, e)| e.owner == Some(worker))
        {
            return Some(self.segment_from(index, entry, worker));
        }

        let count = self.segment_count();
        let index = self.completed.first_clear_in_both(&self.in_use, count)?;
        self.in_use.set(index);
        self.generation += 1;
        let generation = self.generation;
        let entry = self.entries.entry(index).or_insert(Entry {
            written: 0,
            owner: None,
            generation: 0,
        });
        entry.owner = Some(worker);
        entry.generation = generation;
        let entry = *entry;
        let segment = self.segment_from(index, &entry, worker);
        tracing::debug!(
            worker = %worker,
            index,
            offset = segment.position(),
            "segment checked out"
        );
        Some(segment)
    }

    /// Move checked-out segment `index` to `worker` with its written bytes.
    /// The previous owner's copy goes stale. `None` if the segment is not
    /// checked out by another worker.
    pub fn reassign_segment(&mut self, index: usize, worker: WorkerId) -> Option<Segment> {
        let entry = self
            .entries
            .get_mut(&index)
            .filter(|e| e.owner.is_some_and(|o| o != worker))?;
        let previous = entry.owner.replace(worker);
        self.generation += 1;
        entry.generation = self.generation;
        let entry = *entry;
        tracing::debug!(index, from = ?previous, to = %worker, "segment reassigned");
        Some(self.segment_from(index, &entry, worker))
    }

    /// `segment` is still the current checkout of its owner.
    pub fn is_owned(&self, segment: &Segment) -> bool {
        self.entries
            .get(&segment.index)
            .is_some_and(|e| e.owner == Some(segment.owner) && e.generation == segment.generation)
    }

    fn owned_entry_mut(&mut self, segment: &Segment) -> Option<&mut Entry> {
        let (_, length) = self.bounds(segment.index);
        if length.map_or(false, |l| segment.written > l) {
            return None;
        }
        self.entries
            .get_mut(&segment.index)
            .filter(|e| e.owner == Some(segment.owner) && e.generation == segment.generation)
    }

    /// Record the written length of an owned segment.
    ///
    /// Returns false, changing nothing, if the caller no longer owns this
    /// checkout (cancelled or reassigned) or reports more bytes than the
    /// segment holds.
    pub fn update_segment(&mut self, segment: &Segment) -> bool {
        match self.owned_entry_mut(segment) {
            Some(entry) => {
                entry.written = segment.written;
                true
            }
            None => {
                tracing::trace!(index = segment.index, owner = %segment.owner, "stale segment update dropped");
                false
            }
        }
    }

    /// Commit a fully written segment. For an unbounded segment this fixes
    /// the total length to the bytes written.
    pub fn complete_segment(&mut self, segment: &Segment) -> bool {
        let Some(entry) = self.owned_entry_mut(segment) else {
            return false;
        };
        entry.written = segment.written;
        let (_, length) = self.bounds(segment.index);
        match length {
            Some(len) if segment.written < len => return false,
            Some(_) => {}
            None => {
                self.total_length = Some(segment.written);
            }
        }
        self.entries.remove(&segment.index);
        self.in_use.clear(segment.index);
        self.completed.set(segment.index);
        tracing::debug!(index = segment.index, owner = %segment.owner, "segment committed");
        true
    }

    /// Release every segment owned by `worker`, keeping written bytes.
    pub fn cancel_segment(&mut self, worker: WorkerId) {
        let owned: Vec<usize> = self
            .entries
            .iter()
            .filter(|(_, e)| e.owner == Some(worker))
            .map(|(&i, _)| i)
            .collect();
        for index in owned {
            self.in_use.clear(index);
            let keep = match self.entries.get_mut(&index) {
                Some(entry) => {
                    entry.owner = None;
                    entry.written > 0 && self.resumable
                }
                None => false,
            };
            if !keep {
                self.entries.remove(&index);
            }
            tracing::debug!(worker = %worker, index, "segment released");
        }
    }

    /// True iff every byte range is committed.
    pub fn is_finished(&self) -> bool {
        match self.total_length {
            Some(_) => self.completed.all_set(self.segment_count()),
            None => false,
        }
    }

    /// Bytes in committed segments.
    pub fn completed_length(&self) -> u64 {
        (0..self.segment_count())
            .filter(|&i| self.completed.is_set(i))
            .map(|i| self.bounds(i).1.unwrap_or(0))
            .sum()
    }

    /// Committed bytes plus bytes already written into uncommitted segments.
    pub fn downloaded_length(&self) -> u64 {
        self.completed_length() + self.entries.values().map(|e| e.written).sum::<u64>()
    }

    /// Currently checked-out segments.
    pub fn live_segments(&self) -> Vec<Segment> {
        self.entries
            .iter()
            .filter_map(|(&i, e)| e.owner.map(|w| self.segment_from(i, e, w)))
            .collect()
    }

    /// Number of checked-out segments.
    pub fn in_use_count(&self) -> usize {
        self.entries.values().filter(|e| e.owner.is_some()).count()
    }

    /// Mark the whole file committed (target already complete on disk).
    pub fn mark_all_complete(&mut self) {
        for i in 0..self.segment_count() {
            self.completed.set(i);
        }
        self.in_use.clear_all();
        self.entries.clear();
    }

    /// Forget all progress and ownership.
    pub fn reset(&mut self) {
        self.completed.clear_all();
        self.in_use.clear_all();
        self.entries.clear();
    }
}
