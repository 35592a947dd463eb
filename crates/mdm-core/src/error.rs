//! Download errors and terminal result codes.
//!
//! Every failure that crosses a Task boundary is a [`DownloadError`]. Its
//! [`Kind`] decides propagation (retry the connection, fail the group, or
//! fail the group and log loudly); its [`ResultCode`] is what the group
//! reports if the error ends up being terminal.

use std::fmt;

use crate::retry::ErrorKind;

/// Propagation class of a [`DownloadError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Transient failure; the connection is retried after a backoff.
    Retry,
    /// The group cannot succeed with this source (not found, length or checksum mismatch).
    AbortGroup,
    /// Local failure (disk, corrupt state). The group fails; the scheduler keeps running.
    Fatal,
}

/// Terminal classification of a finished download group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Finished,
    UnknownError,
    ResourceNotFound,
    ChecksumFailed,
    /// Stopped (halted or interrupted) before completion.
    InProgress,
    /// Removed by a control operation.
    Removed,
}

impl ResultCode {
    /// Short label used in result tables and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ResultCode::Finished => "OK",
            ResultCode::UnknownError => "ERR",
            ResultCode::ResourceNotFound => "NOTFOUND",
            ResultCode::ChecksumFailed => "CHECKSUM",
            ResultCode::InProgress => "INPR",
            ResultCode::Removed => "RM",
        }
    }

    /// Process exit code for this result.
    pub fn exit_code(self) -> i32 {
        match self {
            ResultCode::Finished => 0,
            ResultCode::UnknownError => 1,
            ResultCode::ResourceNotFound => 3,
            ResultCode::InProgress => 7,
            ResultCode::Removed => 31,
            ResultCode::ChecksumFailed => 32,
        }
    }

    pub fn is_error(self) -> bool {
        !matches!(
            self,
            ResultCode::Finished | ResultCode::InProgress | ResultCode::Removed
        )
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error raised inside a Task invocation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct DownloadError {
    kind: Kind,
    code: ResultCode,
    retry_kind: ErrorKind,
    message: String,
}

impl DownloadError {
    /// Transient failure classified for the retry policy.
    pub fn retry(retry_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: Kind::Retry,
            code: ResultCode::UnknownError,
            retry_kind,
            message: message.into(),
        }
    }

    /// Group-level abort with the given terminal code.
    pub fn abort(code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            kind: Kind::AbortGroup,
            code,
            retry_kind: ErrorKind::Other,
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: Kind::Fatal,
            code: ResultCode::UnknownError,
            retry_kind: ErrorKind::Other,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn code(&self) -> ResultCode {
        self.code
    }

    pub fn retry_kind(&self) -> ErrorKind {
        self.retry_kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for DownloadError {
    fn from(err: anyhow::Error) -> Self {
        DownloadError::fatal(format!("{err:#}"))
    }
}

impl From<std::io::Error> for DownloadError {
    fn from(err: std::io::Error) -> Self {
        DownloadError::fatal(err.to_string())
    }
}
