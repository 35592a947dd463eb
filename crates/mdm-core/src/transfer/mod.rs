//! Readiness source for the scheduler: non-blocking transfers it can poll.
//!
//! The scheduler never blocks on a socket. Connection tasks start transfers
//! through an [`EventPoll`], the scheduler polls it once per tick with a
//! bounded timeout, and each task checks whether its token became ready.
//! [`CurlPoll`] implements this over a single `curl::multi` handle.

mod curl_poll;
mod handler;
mod headers;

pub use curl_poll::CurlPoll;
pub use headers::{parse_content_range, parse_http_status, parse_head_response};

use std::fmt;
use std::time::Duration;

use crate::error::DownloadError;
use crate::storage::StorageWriter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferToken(pub u64);

impl fmt::Display for TransferToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub uri: String,
    pub kind: TransferKind,
    pub connect_timeout: Duration,
}

#[derive(Debug, Clone)]
pub enum TransferKind {
    /// Headers only: size, range support, filename hint.
    Head,
    /// Body bytes `[start, end)` written into `sink` at their file offsets.
    /// `end: None` reads to end of stream.
    Range {
        start: u64,
        end: Option<u64>,
        sink: StorageWriter,
    },
}

/// What a header request learned about the resource.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadInfo {
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    pub content_disposition: Option<String>,
}

#[derive(Debug, Clone)]
pub enum TransferOutcome {
    Headers(HeadInfo),
    /// All requested bytes were written.
    Completed { written: u64 },
    Failed(DownloadError),
}

/// Non-blocking transfer multiplexer polled by the scheduler.
pub trait EventPoll {
    fn start(&mut self, request: TransferRequest) -> Result<TransferToken, DownloadError>;

    /// Abort and forget a transfer. Unknown tokens are ignored.
    fn cancel(&mut self, token: TransferToken);

    /// Drive all transfers, waiting at most `timeout` for activity.
    fn poll(&mut self, timeout: Duration) -> anyhow::Result<()>;

    /// New bytes arrived or the transfer finished during the last poll.
    fn is_ready(&self, token: TransferToken) -> bool;

    /// Body bytes written so far.
    fn written(&self, token: TransferToken) -> u64;

    /// The outcome of a finished transfer; the token is forgotten afterwards.
    fn take_outcome(&mut self, token: TransferToken) -> Option<TransferOutcome>;

    /// Transfers still running.
    fn active_count(&self) -> usize;
}
