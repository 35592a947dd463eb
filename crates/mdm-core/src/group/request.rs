use std::path::PathBuf;
use std::time::Duration;

use crate::config::{FileAllocation, MdmConfig};

/// What the caller asked for: one file, one or more mirror URIs.
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub uris: Vec<String>,
    /// Directory the file is saved to.
    pub dir: PathBuf,
    /// Output filename; derived from the server response or URI when unset.
    pub out: Option<String>,
    /// Expected whole-file SHA-256 (hex).
    pub sha256: Option<String>,
    /// Per-download override of `split`.
    pub split: Option<usize>,
}

impl DownloadRequest {
    pub fn new(uri: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        Self {
            uris: vec![uri.into()],
            dir: dir.into(),
            ..Self::default()
        }
    }
}

/// Config values a group consults after it has been created.
#[derive(Debug, Clone)]
pub struct GroupOptions {
    pub max_connections: usize,
    pub segment_size: u64,
    pub file_allocation: FileAllocation,
    pub no_file_allocation_limit: u64,
    pub allocation_chunk_bytes: u64,
    pub check_chunk_bytes: u64,
    pub check_integrity: bool,
    pub allow_overwrite: bool,
    pub max_file_not_found: u32,
    pub reassign_slow_segments: bool,
    pub startup_idle_time: Duration,
}

impl GroupOptions {
    pub fn from_config(cfg: &MdmConfig, split: Option<usize>) -> Self {
        Self {
            max_connections: split.unwrap_or(cfg.split).max(1),
            segment_size: cfg.segment_size.max(1),
            file_allocation: cfg.file_allocation,
            no_file_allocation_limit: cfg.no_file_allocation_limit,
            allocation_chunk_bytes: cfg.allocation_chunk_bytes.max(1),
            check_chunk_bytes: cfg.check_chunk_bytes.max(1),
            check_integrity: cfg.check_integrity,
            allow_overwrite: cfg.allow_overwrite,
            max_file_not_found: cfg.max_file_not_found,
            reassign_slow_segments: cfg.reassign_slow_segments,
            startup_idle_time: cfg.startup_idle_time(),
        }
    }
}
