use std::path::PathBuf;
use std::time::Duration;

use crate::error::ResultCode;
use crate::registry::Gid;

/// Terminal record of one stopped group.
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub gid: Gid,
    pub code: ResultCode,
    /// Error text when `code` is an error, empty otherwise.
    pub message: String,
    pub path: Option<PathBuf>,
    pub uris: Vec<String>,
    pub total_length: Option<u64>,
    pub completed_length: u64,
    /// Bytes per second over the session.
    pub avg_speed: u64,
    pub session_time: Duration,
}

/// Counts of finished results by kind, plus groups still waiting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadStat {
    pub finished: usize,
    pub error: usize,
    pub in_progress: usize,
    pub removed: usize,
    pub waiting: usize,
    /// Code of the last result that did not finish.
    pub last_error: Option<ResultCode>,
}

impl DownloadStat {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a DownloadResult>, waiting: usize) -> Self {
        let mut stat = DownloadStat {
            waiting,
            ..Default::default()
        };
        for r in results {
            match r.code {
                ResultCode::Finished => stat.finished += 1,
                ResultCode::InProgress => stat.in_progress += 1,
                ResultCode::Removed => stat.removed += 1,
                _ => stat.error += 1,
            }
            if r.code != ResultCode::Finished {
                stat.last_error = Some(r.code);
            }
        }
        stat
    }

    /// Process exit code: that of the last unfinished result, 0 if all finished.
    pub fn exit_code(&self) -> i32 {
        self.last_error.map_or(0, ResultCode::exit_code)
    }
}
