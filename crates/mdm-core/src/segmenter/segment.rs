use std::fmt;

/// Identifies the connection that owns a checked-out segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A checked-out byte range: `[start, start + length)`.
///
/// `written` bytes from `start` are already on disk. `generation` ties the
/// copy a worker holds to the manager's record; a copy from an older
/// checkout is stale and its updates are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub start: u64,
    /// `None` when the total length is unknown; the range runs to end of stream.
    pub length: Option<u64>,
    pub written: u64,
    pub owner: WorkerId,
    pub generation: u64,
}

impl Segment {
    /// Exclusive end offset, if bounded.
    pub fn end(&self) -> Option<u64> {
        self.length.map(|l| self.start + l)
    }

    /// Next offset to write.
    pub fn position(&self) -> u64 {
        self.start + self.written
    }

    pub fn remaining(&self) -> Option<u64> {
        self.length.map(|l| l.saturating_sub(self.written))
    }

    pub fn is_complete(&self) -> bool {
        self.length.map_or(false, |l| self.written >= l)
    }

    /// True if the unwritten parts of two segments share any byte.
    pub fn overlaps(&self, other: &Segment) -> bool {
        let a_end = self.end().unwrap_or(u64::MAX);
        let b_end = other.end().unwrap_or(u64::MAX);
        self.position() < b_end && other.position() < a_end
    }
}
