//! [`EventPoll`] over one `curl::multi` handle: perform, wait, messages.

use anyhow::Result;
use std::collections::HashMap;
use std::time::Duration;

use curl::easy::Easy2;
use curl::multi::{Easy2Handle, Multi};

use crate::error::DownloadError;
use crate::retry::error_for_curl;

use super::handler::TransferHandler;
use super::{EventPoll, TransferKind, TransferOutcome, TransferRequest, TransferToken};

struct Transfer {
    /// `None` once finished and removed from the multi handle.
    handle: Option<Easy2Handle<TransferHandler>>,
    outcome: Option<TransferOutcome>,
    written: u64,
    ready: bool,
}

pub struct CurlPoll {
    multi: Multi,
    next_token: u64,
    transfers: HashMap<TransferToken, Transfer>,
}

impl Default for CurlPoll {
    fn default() -> Self {
        Self::new()
    }
}

impl CurlPoll {
    pub fn new() -> Self {
        Self {
            multi: Multi::new(),
            next_token: 0,
            transfers: HashMap::new(),
        }
    }

    fn easy_for(request: TransferRequest) -> Result<Easy2<TransferHandler>, curl::Error> {
        let range = match &request.kind {
            TransferKind::Head => None,
            TransferKind::Range { start, end, .. } => match end {
                Some(end) => Some(format!("{start}-{}", end.saturating_sub(1))),
                None if *start > 0 => Some(format!("{start}-")),
                None => None,
            },
        };
        let head_only = matches!(request.kind, TransferKind::Head);
        let mut easy = Easy2::new(TransferHandler::new(request.uri.clone(), request.kind));
        easy.url(&request.uri)?;
        easy.follow_location(true)?;
        easy.max_redirections(10)?;
        easy.connect_timeout(request.connect_timeout)?;
        if head_only {
            easy.nobody(true)?;
        }
        if let Some(range) = range {
            easy.range(&range)?;
        }
        Ok(easy)
    }

    fn drive(&mut self) -> Result<()> {
        self.multi
            .perform()
            .map_err(|e| anyhow::anyhow!("curl multi perform: {}", e))?;

        let mut finished: Vec<(TransferToken, Result<(), curl::Error>)> = Vec::new();
        let transfers = &self.transfers;
        self.multi.messages(|msg| {
            for (token, t) in transfers {
                if let Some(handle) = &t.handle {
                    if let Some(res) = msg.result_for2(handle) {
                        finished.push((*token, res));
                        break;
                    }
                }
            }
        });

        for (token, res) in finished {
            let Some(t) = self.transfers.get_mut(&token) else {
                continue;
            };
            let Some(handle) = t.handle.take() else {
                continue;
            };
            let mut easy = self
                .multi
                .remove2(handle)
                .map_err(|e| anyhow::anyhow!("curl multi remove: {}", e))?;
            let code = easy.response_code().unwrap_or(0);
            let length = easy
                .content_length_download()
                .ok()
                .filter(|l| *l >= 0.0)
                .map(|l| l as u64);
            let handler = easy.get_mut();
            t.written = handler.written();
            t.outcome = Some(handler.outcome(res, code, length));
            t.ready = true;
            tracing::trace!(token = %token, written = t.written, "transfer finished");
        }

        for t in self.transfers.values_mut() {
            if let Some(handle) = &t.handle {
                let now = handle.get_ref().written();
                if now != t.written {
                    t.written = now;
                    t.ready = true;
                }
            }
        }
        Ok(())
    }

    fn any_ready(&self) -> bool {
        self.transfers.values().any(|t| t.ready)
    }
}

impl EventPoll for CurlPoll {
    fn start(&mut self, request: TransferRequest) -> Result<TransferToken, DownloadError> {
        let uri = request.uri.clone();
        let easy = Self::easy_for(request).map_err(|e| error_for_curl(&e, &uri))?;
        let handle = self
            .multi
            .add2(easy)
            .map_err(|e| DownloadError::fatal(format!("curl multi add: {e}")))?;
        self.next_token += 1;
        let token = TransferToken(self.next_token);
        self.transfers.insert(
            token,
            Transfer {
                handle: Some(handle),
                outcome: None,
                written: 0,
                ready: false,
            },
        );
        tracing::debug!(token = %token, uri, "transfer started");
        Ok(token)
    }

    fn cancel(&mut self, token: TransferToken) {
        if let Some(t) = self.transfers.remove(&token) {
            if let Some(handle) = t.handle {
                if let Err(e) = self.multi.remove2(handle) {
                    tracing::warn!(token = %token, "curl multi remove on cancel: {e}");
                }
            }
            tracing::debug!(token = %token, "transfer cancelled");
        }
    }

    fn poll(&mut self, timeout: Duration) -> Result<()> {
        for t in self.transfers.values_mut() {
            t.ready = t.outcome.is_some();
        }
        if self.active_count() == 0 {
            if !timeout.is_zero() && !self.any_ready() {
                std::thread::sleep(timeout);
            }
            return Ok(());
        }
        self.drive()?;
        if !self.any_ready() && !timeout.is_zero() {
            self.multi
                .wait(&mut [], timeout)
                .map_err(|e| anyhow::anyhow!("curl multi wait: {}", e))?;
            self.drive()?;
        }
        Ok(())
    }

    fn is_ready(&self, token: TransferToken) -> bool {
        self.transfers.get(&token).is_some_and(|t| t.ready)
    }

    fn written(&self, token: TransferToken) -> u64 {
        self.transfers.get(&token).map_or(0, |t| t.written)
    }

    fn take_outcome(&mut self, token: TransferToken) -> Option<TransferOutcome> {
        let outcome = self.transfers.get_mut(&token)?.outcome.take()?;
        self.transfers.remove(&token);
        Some(outcome)
    }

    fn active_count(&self) -> usize {
        self.transfers.values().filter(|t| t.handle.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageWriter;
    use std::time::Instant;

    fn run_until_done(poll: &mut CurlPoll, token: TransferToken) -> TransferOutcome {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            poll.poll(Duration::from_millis(50)).unwrap();
            if let Some(o) = poll.take_outcome(token) {
                return o;
            }
            assert!(Instant::now() < deadline, "transfer did not finish");
        }
    }

    fn file_uri(path: &std::path::Path) -> String {
        url::Url::from_file_path(path).unwrap().to_string()
    }

    #[test]
    fn file_range_lands_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"0123456789").unwrap();
        let sink = StorageWriter::create(&dir.path().join("dst.part")).unwrap();

        let mut poll = CurlPoll::new();
        let token = poll
            .start(TransferRequest {
                uri: file_uri(&src),
                kind: TransferKind::Range {
                    start: 3,
                    end: Some(7),
                    sink: sink.clone(),
                },
                connect_timeout: Duration::from_secs(5),
            })
            .unwrap();
        assert_eq!(poll.active_count(), 1);
        match run_until_done(&mut poll, token) {
            TransferOutcome::Completed { written } => assert_eq!(written, 4),
            other => panic!("unexpected {other:?}"),
        }
        let mut buf = [0u8; 4];
        sink.read_at(3, &mut buf).unwrap();
        assert_eq!(&buf, b"3456");
        assert_eq!(poll.active_count(), 0);
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let mut poll = CurlPoll::new();
        let token = poll
            .start(TransferRequest {
                uri: file_uri(&dir.path().join("nope.bin")),
                kind: TransferKind::Head,
                connect_timeout: Duration::from_secs(5),
            })
            .unwrap();
        match run_until_done(&mut poll, token) {
            TransferOutcome::Failed(e) => {
                assert_eq!(e.code(), crate::error::ResultCode::ResourceNotFound)
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cancel_forgets_token() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        std::fs::write(&src, b"x").unwrap();
        let mut poll = CurlPoll::new();
        let token = poll
            .start(TransferRequest {
                uri: file_uri(&src),
                kind: TransferKind::Head,
                connect_timeout: Duration::from_secs(5),
            })
            .unwrap();
        poll.cancel(token);
        assert_eq!(poll.active_count(), 0);
        assert!(!poll.is_ready(token));
        assert!(poll.take_outcome(token).is_none());
    }
}
