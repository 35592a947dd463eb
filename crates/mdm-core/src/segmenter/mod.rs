//! Byte-range segmentation of one download.
//!
//! A [`SegmentManager`] divides a file into fixed-size segments, lends each
//! one to at most one worker at a time, tracks how many bytes of every
//! partially written segment are already on disk, and persists that state to
//! a control file so an interrupted download resumes where it stopped.

mod bitmap;
mod control_file;
mod manager;
mod segment;

pub use bitmap::SegmentBitmap;
pub use control_file::{control_path, FreshReason, LoadOutcome, CONTROL_SUFFIX};
pub use manager::SegmentManager;
pub use segment::{Segment, WorkerId};
