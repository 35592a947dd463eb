//! Control file: the persisted segment set of one download.
//!
//! JSON document `{version, body, digest}` where `digest` is the SHA-256 of
//! the serialized body. Written to a sibling temp file and renamed into
//! place. Loading never fails hard: anything unexpected means "start fresh".

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use super::bitmap::SegmentBitmap;
use super::manager::{Entry, SegmentManager};

/// Control file suffix: `file.iso` → `file.iso.mdm`.
pub const CONTROL_SUFFIX: &str = ".mdm";

const FORMAT_VERSION: u32 = 1;

pub fn control_path(final_path: &Path) -> PathBuf {
    let mut o = final_path.as_os_str().to_owned();
    o.push(CONTROL_SUFFIX);
    PathBuf::from(o)
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlFile {
    version: u32,
    body: ControlBody,
    digest: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ControlBody {
    /// File name of the download target.
    target: String,
    total_length: u64,
    segment_length: u64,
    /// Hex of the completed-segment bitmap.
    completed: String,
    partial: Vec<PartialRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PartialRecord {
    index: usize,
    written: u64,
}

/// Result of [`SegmentManager::load`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Resumed { completed_length: u64 },
    Fresh(FreshReason),
}

/// Why a load fell back to starting fresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshReason {
    NoControlFile,
    /// Length unknown or source cannot resume; nothing to load.
    NotResumable,
    Unreadable,
    VersionMismatch,
    /// Truncated, unparsable, or digest mismatch.
    Corrupt,
    /// Recorded for a different file name, length, or segment size.
    TargetMismatch,
}

fn body_digest(body: &ControlBody) -> Result<String> {
    let bytes = serde_json::to_vec(body).context("serialize control body")?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

fn target_name(control: &Path) -> String {
    let name = control
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(CONTROL_SUFFIX)
        .map(str::to_string)
        .unwrap_or(name)
}

impl SegmentManager {
    /// Write the segment set to the control file. Rewrites the whole file, so
    /// repeated calls with unchanged state produce identical bytes.
    pub fn persist(&self) -> Result<()> {
        let (Some(path), Some(total)) = (self.control_path.as_deref(), self.total_length) else {
            return Ok(());
        };
        if !self.is_resumable() {
            return Ok(());
        }
        let count = self.segment_count();
        let body = ControlBody {
            target: target_name(path),
            total_length: total,
            segment_length: self.segment_length,
            completed: hex::encode(self.completed.to_bytes(count)),
            partial: self
                .entries
                .iter()
                .filter(|(_, e)| e.written > 0)
                .map(|(&index, e)| PartialRecord {
                    index,
                    written: e.written,
                })
                .collect(),
        };
        let file = ControlFile {
            version: FORMAT_VERSION,
            digest: body_digest(&body)?,
            body,
        };
        let json = serde_json::to_vec_pretty(&file).context("serialize control file")?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json)
            .with_context(|| format!("write control file: {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("install control file: {}", path.display()))?;
        Ok(())
    }

    /// Restore committed segments and partial progress from the control file.
    ///
    /// All restored segments are unowned. On any fallback the manager is
    /// left unchanged.
    pub fn load(&mut self) -> LoadOutcome {
        self.load_against(None)
    }

    /// Like [`load`](Self::load), but the recorded progress must fit in a
    /// data file of `data_length` bytes. A shorter data file lost bytes the
    /// control file counts as written, so the load falls back with
    /// [`FreshReason::TargetMismatch`].
    pub fn load_against(&mut self, data_length: Option<u64>) -> LoadOutcome {
        let outcome = self.try_load(data_length);
        match outcome {
            LoadOutcome::Resumed { completed_length } => {
                tracing::info!(completed_length, "resuming from control file")
            }
            LoadOutcome::Fresh(FreshReason::NoControlFile) => {}
            LoadOutcome::Fresh(reason) => {
                tracing::warn!(?reason, path = ?self.control_path, "control file ignored, starting fresh")
            }
        }
        outcome
    }

    fn try_load(&mut self, data_length: Option<u64>) -> LoadOutcome {
        let (Some(path), Some(total)) = (self.control_path.clone(), self.total_length) else {
            return LoadOutcome::Fresh(FreshReason::NotResumable);
        };
        if !self.is_resumable() {
            return LoadOutcome::Fresh(FreshReason::NotResumable);
        }
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return LoadOutcome::Fresh(FreshReason::NoControlFile)
            }
            Err(_) => return LoadOutcome::Fresh(FreshReason::Unreadable),
        };
        let file: ControlFile = match serde_json::from_slice(&bytes) {
            Ok(f) => f,
            Err(_) => return LoadOutcome::Fresh(FreshReason::Corrupt),
        };
        if file.version != FORMAT_VERSION {
            return LoadOutcome::Fresh(FreshReason::VersionMismatch);
        }
        match body_digest(&file.body) {
            Ok(d) if d == file.digest => {}
            _ => return LoadOutcome::Fresh(FreshReason::Corrupt),
        }
        let body = file.body;
        if body.target != target_name(&path)
            || body.total_length != total
            || body.segment_length != self.segment_length
        {
            return LoadOutcome::Fresh(FreshReason::TargetMismatch);
        }
        let Ok(completed) = hex::decode(&body.completed) else {
            return LoadOutcome::Fresh(FreshReason::Corrupt);
        };

        let count = self.segment_count();
        let completed = SegmentBitmap::from_bytes(&completed, count);
        if let Some(data_length) = data_length {
            let end = self.recorded_end(&completed, &body.partial);
            if end > data_length {
                tracing::warn!(data_length, recorded_end = end, "data file shorter than recorded progress");
                return LoadOutcome::Fresh(FreshReason::TargetMismatch);
            }
        }

        self.reset();
        self.completed = completed;
        for rec in body.partial {
            if rec.index >= count || self.completed.is_set(rec.index) {
                continue;
            }
            let len = self.bounds(rec.index).1.unwrap_or(0);
            if rec.written >= len {
                self.completed.set(rec.index);
                continue;
            }
            self.entries.insert(
                rec.index,
                Entry {
                    written: rec.written,
                    owner: None,
                    generation: 0,
                },
            );
        }
        LoadOutcome::Resumed {
            completed_length: self.completed_length(),
        }
    }

    /// Highest file offset the recorded progress claims is on disk.
    fn recorded_end(&self, completed: &SegmentBitmap, partial: &[PartialRecord]) -> u64 {
        let committed = (0..self.segment_count())
            .rev()
            .find(|&i| completed.is_set(i))
            .map(|i| {
                let (start, len) = self.bounds(i);
                start + len.unwrap_or(0)
            })
            .unwrap_or(0);
        partial
            .iter()
            .filter(|rec| rec.index < self.segment_count() && rec.written > 0)
            .map(|rec| {
                let (start, len) = self.bounds(rec.index);
                start + len.map_or(rec.written, |l| rec.written.min(l))
            })
            .fold(committed, u64::max)
    }

    /// Delete the control file if present.
    pub fn remove_control_file(&self) -> Result<()> {
        if let Some(path) = &self.control_path {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("remove control file: {}", path.display()))
                }
            }
        }
        Ok(())
    }
}
