//! Retry classification and backoff policy.
//!
//! Transport failures (curl errors, HTTP statuses) are classified into an
//! [`ErrorKind`] and wrapped as [`crate::error::DownloadError`]s; connection
//! Tasks feed the kind back into [`RetryPolicy::decide`] to pick a backoff.

mod classify;
mod policy;

pub use classify::{classify_curl_error, classify_http_status, error_for_curl, error_for_http_status};
pub use policy::{ErrorKind, RetryDecision, RetryPolicy};
