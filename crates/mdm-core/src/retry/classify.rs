//! Map HTTP statuses and curl errors onto retry kinds and download errors.

use crate::error::{DownloadError, ResultCode};
use crate::retry::policy::ErrorKind;

/// Classify an HTTP status code for retry decisions.
pub fn classify_http_status(code: u32) -> ErrorKind {
    match code {
        429 | 503 => ErrorKind::Throttled,
        500..=599 => ErrorKind::Http5xx(code as u16),
        _ => ErrorKind::Other,
    }
}

/// Classify a curl error for retry decisions.
pub fn classify_curl_error(e: &curl::Error) -> ErrorKind {
    if e.is_operation_timedout() {
        return ErrorKind::Timeout;
    }
    if e.is_couldnt_connect()
        || e.is_couldnt_resolve_host()
        || e.is_couldnt_resolve_proxy()
        || e.is_read_error()
        || e.is_recv_error()
        || e.is_send_error()
        || e.is_got_nothing()
        || e.is_partial_file()
    {
        return ErrorKind::Connection;
    }
    ErrorKind::Other
}

/// Error for a final HTTP status >= 400.
pub fn error_for_http_status(code: u32, uri: &str) -> DownloadError {
    match code {
        404 | 410 => DownloadError::abort(
            ResultCode::ResourceNotFound,
            format!("resource not found (HTTP {code}): {uri}"),
        ),
        _ => match classify_http_status(code) {
            ErrorKind::Other => {
                DownloadError::abort(ResultCode::UnknownError, format!("HTTP {code}: {uri}"))
            }
            kind => DownloadError::retry(kind, format!("HTTP {code}: {uri}")),
        },
    }
}

/// `CURLE_REMOTE_FILE_NOT_FOUND`; the curl crate has no predicate for it.
const CURLE_REMOTE_FILE_NOT_FOUND: i32 = 78;

/// Error for a failed curl transfer.
pub fn error_for_curl(e: &curl::Error, uri: &str) -> DownloadError {
    if e.code() as i32 == CURLE_REMOTE_FILE_NOT_FOUND || e.is_file_couldnt_read_file() {
        return DownloadError::abort(
            ResultCode::ResourceNotFound,
            format!("resource not found: {uri}: {e}"),
        );
    }
    match classify_curl_error(e) {
        ErrorKind::Other => DownloadError::abort(ResultCode::UnknownError, format!("{uri}: {e}")),
        kind => DownloadError::retry(kind, format!("{uri}: {e}")),
    }
}
