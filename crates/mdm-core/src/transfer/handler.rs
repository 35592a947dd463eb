//! Easy2 handler for one transfer.
//!
//! Range transfers validate the response before the first body byte is
//! written: HTTP needs 206 with a matching `Content-Range`, or 200 when the
//! range starts at 0. Writes go to storage at `start + written` and stop at
//! the requested end.

use std::str;

use crate::error::{DownloadError, ResultCode};
use crate::retry::{error_for_curl, error_for_http_status, ErrorKind};
use crate::storage::StorageWriter;

use super::headers::{parse_content_range, parse_http_status, parse_head_response};
use super::{HeadInfo, TransferKind, TransferOutcome};

pub(super) struct TransferHandler {
    uri: String,
    kind: TransferKind,
    is_http: bool,
    headers: Vec<String>,
    /// None until the first body byte; then the verdict on the response.
    checked: Option<Result<(), DownloadError>>,
    written: u64,
    /// The server sent past the requested end; the excess was discarded.
    overflow: bool,
    write_error: Option<DownloadError>,
}

impl TransferHandler {
    pub(super) fn new(uri: String, kind: TransferKind) -> Self {
        let is_http = uri.starts_with("http://") || uri.starts_with("https://");
        Self {
            uri,
            kind,
            is_http,
            headers: Vec::new(),
            checked: None,
            written: 0,
            overflow: false,
            write_error: None,
        }
    }

    pub(super) fn written(&self) -> u64 {
        self.written
    }

    fn limit(&self) -> Option<u64> {
        match &self.kind {
            TransferKind::Range {
                start,
                end: Some(end),
                ..
            } => Some(end.saturating_sub(*start)),
            _ => None,
        }
    }

    fn check_response(&self) -> Result<(), DownloadError> {
        if !self.is_http {
            return Ok(());
        }
        let status = parse_http_status(&self.headers).unwrap_or(0);
        if status >= 400 {
            return Err(error_for_http_status(status, &self.uri));
        }
        let TransferKind::Range { start, end, .. } = &self.kind else {
            return Ok(());
        };
        match status {
            206 => {
                let expected_last = end.map(|e| e.saturating_sub(1));
                match parse_content_range(&self.headers) {
                    Some((first, last, _))
                        if first == *start && expected_last.map_or(true, |l| l == last) =>
                    {
                        Ok(())
                    }
                    _ => Err(DownloadError::abort(
                        ResultCode::UnknownError,
                        format!("invalid Content-Range for bytes {start}-: {}", self.uri),
                    )),
                }
            }
            200 if *start == 0 => Ok(()),
            _ => Err(DownloadError::abort(
                ResultCode::UnknownError,
                format!("server ignored range request (HTTP {status}): {}", self.uri),
            )),
        }
    }

    /// Classify the finished transfer.
    pub(super) fn outcome(
        &mut self,
        result: Result<(), curl::Error>,
        response_code: u32,
        content_length_download: Option<u64>,
    ) -> TransferOutcome {
        if let Some(e) = self.write_error.take() {
            return TransferOutcome::Failed(e);
        }
        if let Some(Err(e)) = self.checked.take() {
            return TransferOutcome::Failed(e);
        }
        if let Err(e) = result {
            if !(e.is_write_error() && self.overflow) {
                return TransferOutcome::Failed(error_for_curl(&e, &self.uri));
            }
        }
        if self.is_http && response_code >= 400 {
            return TransferOutcome::Failed(error_for_http_status(response_code, &self.uri));
        }
        match &self.kind {
            TransferKind::Head => {
                let mut info = parse_head_response(&self.headers);
                if !self.is_http {
                    info = HeadInfo {
                        content_length: info.content_length.or(content_length_download),
                        accept_ranges: true,
                        ..info
                    };
                }
                TransferOutcome::Headers(info)
            }
            TransferKind::Range { .. } => match self.limit() {
                Some(limit) if self.written < limit => TransferOutcome::Failed(DownloadError::retry(
                    ErrorKind::Connection,
                    format!("short transfer: {} of {limit} bytes from {}", self.written, self.uri),
                )),
                _ => TransferOutcome::Completed {
                    written: self.written,
                },
            },
        }
    }
}

impl curl::easy::Handler for TransferHandler {
    fn header(&mut self, data: &[u8]) -> bool {
        if let Ok(s) = str::from_utf8(data) {
            let line = s.trim_end();
            if line.starts_with("HTTP/") {
                self.headers.clear();
            }
            if !line.is_empty() {
                self.headers.push(line.to_string());
            }
        }
        true
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, curl::easy::WriteError> {
        if self.checked.is_none() {
            self.checked = Some(self.check_response());
        }
        if matches!(self.checked, Some(Err(_))) {
            return Ok(0);
        }
        let limit = self.limit();
        let TransferKind::Range { start, sink, .. } = &self.kind else {
            return Ok(data.len());
        };
        let take = match limit {
            Some(l) => (l.saturating_sub(self.written)).min(data.len() as u64) as usize,
            None => data.len(),
        };
        if take > 0 {
            if let Err(e) = sink.write_at(start + self.written, &data[..take]) {
                self.write_error = Some(DownloadError::fatal(format!("{e:#}")));
                return Ok(0);
            }
            self.written += take as u64;
        }
        if take < data.len() {
            self.overflow = true;
            return Ok(0);
        }
        Ok(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use curl::easy::Handler;

    fn range_handler(start: u64, end: Option<u64>) -> (tempfile::TempDir, StorageWriter, TransferHandler) {
        let dir = tempfile::tempdir().unwrap();
        let sink = StorageWriter::create(&dir.path().join("out.part")).unwrap();
        let h = TransferHandler::new(
            "http://host/file".to_string(),
            TransferKind::Range {
                start,
                end,
                sink: sink.clone(),
            },
        );
        (dir, sink, h)
    }

    #[test]
    fn headers_restart_on_each_status_line() {
        let (_d, _s, mut h) = range_handler(0, Some(10));
        h.header(b"HTTP/1.1 302 Found\r\n");
        h.header(b"Location: http://other/\r\n");
        assert_eq!(h.headers.len(), 2);
        h.header(b"HTTP/1.1 206 Partial Content\r\n");
        assert_eq!(h.headers.len(), 1);
    }

    #[test]
    fn rejects_200_for_mid_file_range() {
        let (_d, _s, mut h) = range_handler(100, Some(200));
        h.header(b"HTTP/1.1 200 OK\r\n");
        assert_eq!(h.write(b"data").unwrap(), 0);
        assert_eq!(h.written(), 0);
        match h.outcome(Ok(()), 200, None) {
            TransferOutcome::Failed(e) => assert_eq!(e.code(), ResultCode::UnknownError),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn writes_206_body_at_offset() {
        let (_d, sink, mut h) = range_handler(250, Some(258));
        h.header(b"HTTP/1.1 206 Partial Content\r\n");
        h.header(b"Content-Range: bytes 250-257/1000\r\n");
        assert_eq!(h.write(b"abcd").unwrap(), 4);
        assert_eq!(h.write(b"efgh").unwrap(), 4);
        assert_eq!(h.written(), 8);
        let mut buf = [0u8; 8];
        sink.read_at(250, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
        assert!(matches!(
            h.outcome(Ok(()), 206, None),
            TransferOutcome::Completed { written: 8 }
        ));
    }

    #[test]
    fn full_body_200_is_capped_at_range_end() {
        let (_d, _s, mut h) = range_handler(0, Some(6));
        h.header(b"HTTP/1.1 200 OK\r\n");
        assert_eq!(h.write(b"abcd").unwrap(), 4);
        assert_eq!(h.write(b"efgh").unwrap(), 0);
        assert_eq!(h.written(), 6);
        assert!(h.overflow);
        assert!(matches!(
            h.outcome(Err(curl::Error::new(23)), 200, None),
            TransferOutcome::Completed { written: 6 }
        ));
    }

    #[test]
    fn short_body_is_retryable() {
        let (_d, _s, mut h) = range_handler(0, Some(100));
        h.header(b"HTTP/1.1 206 Partial Content\r\n");
        h.header(b"Content-Range: bytes 0-99/100\r\n");
        h.write(b"abc").unwrap();
        match h.outcome(Ok(()), 206, None) {
            TransferOutcome::Failed(e) => assert_eq!(e.kind(), crate::error::Kind::Retry),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_resource_head() {
        let mut h = TransferHandler::new("http://host/missing".to_string(), TransferKind::Head);
        h.header(b"HTTP/1.1 404 Not Found\r\n");
        match h.outcome(Ok(()), 404, None) {
            TransferOutcome::Failed(e) => assert_eq!(e.code(), ResultCode::ResourceNotFound),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_http_head_assumes_ranges() {
        let mut h = TransferHandler::new("ftp://host/pub/f.bin".to_string(), TransferKind::Head);
        match h.outcome(Ok(()), 0, Some(4096)) {
            TransferOutcome::Headers(p) => {
                assert_eq!(p.content_length, Some(4096));
                assert!(p.accept_ranges);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
