//! Per-connection state machine: size up the resource, then pull segments and
//! transfer them one after another until none are left.

use std::time::{Duration, Instant};

use crate::chunked::ChunkedKind;
use crate::error::{DownloadError, Kind, ResultCode};
use crate::group::SizeDecision;
use crate::registry::Gid;
use crate::retry::RetryDecision;
use crate::segmenter::{Segment, WorkerId};
use crate::transfer::{TransferKind, TransferOutcome, TransferRequest, TransferToken};

use super::routine::SleepTask;
use super::task::{Interest, Task, TaskContext, TaskStatus};

/// How long a connection holds back while the overall speed limit binds.
const THROTTLE_WAIT: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum State {
    /// Request the headers of `uri`.
    Negotiate,
    Sizing {
        token: TransferToken,
    },
    /// Check out the next segment.
    Acquire,
    /// Over the overall speed limit; back to `Acquire` at `until`.
    Throttled {
        until: Instant,
    },
    Transferring {
        token: TransferToken,
        segment: Segment,
        /// `segment.written` when this transfer started.
        base_written: u64,
    },
}

enum Step {
    Continue,
    Done(TaskStatus),
}

#[derive(Debug)]
pub struct ConnectionTask {
    gid: Gid,
    worker: WorkerId,
    uri: String,
    state: State,
    attempt: u32,
    deadline: Option<Instant>,
}

impl ConnectionTask {
    /// A connection that first requests the resource headers.
    pub fn negotiate(gid: Gid, worker: WorkerId, uri: String) -> Self {
        Self::with_state(gid, worker, uri, State::Negotiate)
    }

    /// A connection for a group whose size is already known.
    pub fn transfer(gid: Gid, worker: WorkerId, uri: String) -> Self {
        Self::with_state(gid, worker, uri, State::Acquire)
    }

    fn with_state(gid: Gid, worker: WorkerId, uri: String, state: State) -> Self {
        Self {
            gid,
            worker,
            uri,
            state,
            attempt: 0,
            deadline: None,
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn step(&mut self, cx: &mut TaskContext<'_>) -> Result<Step, DownloadError> {
        if matches!(self.state, State::Acquire)
            && cx
                .registry
                .overall_download_speed_exceeds(cx.config.max_overall_download_limit, cx.now)
        {
            tracing::trace!(gid = %self.gid, worker = %self.worker, "overall speed limit reached, holding back");
            self.state = State::Throttled {
                until: cx.now + THROTTLE_WAIT,
            };
            return Ok(Step::Done(TaskStatus::Queued));
        }
        let Some(group) = cx.registry.group_mut(self.gid) else {
            return Ok(Step::Done(TaskStatus::Terminated));
        };
        let timeout = cx.config.timeout();

        match std::mem::replace(&mut self.state, State::Acquire) {
            State::Negotiate => {
                if !group.open_connection() {
                    return Ok(Step::Done(TaskStatus::Terminated));
                }
                let request = TransferRequest {
                    uri: self.uri.clone(),
                    kind: TransferKind::Head,
                    connect_timeout: cx.config.connect_timeout(),
                };
                let token = match cx.poll.start(request) {
                    Ok(t) => t,
                    Err(e) => {
                        group.close_connection();
                        return Err(e);
                    }
                };
                tracing::debug!(gid = %self.gid, worker = %self.worker, uri = %self.uri, "requesting headers");
                self.state = State::Sizing { token };
                self.deadline = Some(cx.now + timeout);
                Ok(Step::Done(TaskStatus::Queued))
            }

            State::Sizing { token } => {
                let Some(outcome) = cx.poll.take_outcome(token) else {
                    self.state = State::Sizing { token };
                    return Ok(Step::Done(TaskStatus::Queued));
                };
                group.close_connection();
                let info = match outcome {
                    TransferOutcome::Headers(p) => p,
                    TransferOutcome::Failed(e) => return Err(e),
                    TransferOutcome::Completed { .. } => {
                        return Err(DownloadError::fatal("header request returned a body transfer"))
                    }
                };
                self.deadline = None;
                if group.is_size_pending() {
                    let path = group
                        .resolve_path(&self.uri, info.content_disposition.as_deref())
                        .to_path_buf();
                    if cx.registry.is_path_in_use(&path, self.gid) {
                        return Err(DownloadError::abort(
                            ResultCode::UnknownError,
                            format!("file {} is being downloaded by another download", path.display()),
                        ));
                    }
                }
                let Some(group) = cx.registry.group_mut(self.gid) else {
                    return Ok(Step::Done(TaskStatus::Terminated));
                };
                let decision = group.on_file_size_determined(
                    &self.uri,
                    info.content_length,
                    info.accept_ranges,
                    info.content_disposition.as_deref(),
                )?;
                match decision {
                    SizeDecision::AlreadyComplete => Ok(Step::Done(TaskStatus::Terminated)),
                    SizeDecision::NeedsAllocation => {
                        cx.enqueue_chunked(self.gid, ChunkedKind::FileAllocation);
                        Ok(Step::Done(TaskStatus::Terminated))
                    }
                    SizeDecision::NeedsVerification => {
                        cx.enqueue_chunked(self.gid, ChunkedKind::IntegrityCheck);
                        Ok(Step::Done(TaskStatus::Terminated))
                    }
                    SizeDecision::StartFresh | SizeDecision::Resume => {
                        let extra = group.extra_connections();
                        let peers = group.create_transfer_tasks(extra);
                        for t in peers {
                            cx.spawn(t);
                        }
                        Ok(Step::Continue)
                    }
                }
            }

            State::Throttled { until } => {
                if cx.now < until {
                    self.state = State::Throttled { until };
                    return Ok(Step::Done(TaskStatus::Queued));
                }
                Ok(Step::Continue)
            }

            State::Acquire => {
                if group.is_halt_requested() {
                    return Ok(Step::Done(TaskStatus::Terminated));
                }
                let sink = group.storage().cloned();
                let Some(segments) = group.segments_mut() else {
                    return Err(DownloadError::fatal("segments not initialized"));
                };
                let (segment, taken_over) = match segments.request_segment(self.worker) {
                    Some(segment) => (segment, false),
                    None => match group.take_over_slow_segment(self.worker, cx.now) {
                        Some(segment) => (segment, true),
                        None => {
                            if group.needs_verification() {
                                group.prepare_verification()?;
                                cx.enqueue_chunked(self.gid, ChunkedKind::IntegrityCheck);
                            }
                            return Ok(Step::Done(TaskStatus::Terminated));
                        }
                    },
                };
                let Some(sink) = sink else {
                    return Err(DownloadError::fatal("storage not open"));
                };
                if !group.open_connection() {
                    return Ok(Step::Done(TaskStatus::Terminated));
                }
                group.start_worker(self.worker, cx.now);
                let request = TransferRequest {
                    uri: self.uri.clone(),
                    kind: TransferKind::Range {
                        start: segment.position(),
                        end: segment.end(),
                        sink,
                    },
                    connect_timeout: cx.config.connect_timeout(),
                };
                let token = match cx.poll.start(request) {
                    Ok(t) => t,
                    Err(e) => {
                        group.close_connection();
                        return Err(e);
                    }
                };
                tracing::debug!(
                    gid = %self.gid,
                    worker = %self.worker,
                    index = segment.index,
                    offset = segment.position(),
                    "transfer started"
                );
                self.state = State::Transferring {
                    token,
                    segment,
                    base_written: segment.written,
                };
                self.deadline = Some(cx.now + timeout);
                if taken_over {
                    // the previous owner may be idle on a stalled transfer
                    cx.wake_all();
                }
                Ok(Step::Done(TaskStatus::Queued))
            }

            State::Transferring {
                token,
                mut segment,
                base_written,
            } => {
                if !group.segments().is_some_and(|s| s.is_owned(&segment)) {
                    tracing::debug!(gid = %self.gid, worker = %self.worker, index = segment.index, "segment taken over, dropping transfer");
                    cx.poll.cancel(token);
                    group.close_connection();
                    self.deadline = None;
                    return Ok(Step::Done(TaskStatus::Terminated));
                }
                let written = base_written + cx.poll.written(token);
                if written > segment.written {
                    let delta = written - segment.written;
                    segment.written = written;
                    let accepted = group
                        .segments_mut()
                        .is_some_and(|s| s.update_segment(&segment));
                    if !accepted {
                        cx.poll.cancel(token);
                        group.close_connection();
                        return Ok(Step::Done(TaskStatus::Terminated));
                    }
                    group.record_worker_progress(self.worker, cx.now, delta);
                    self.deadline = Some(cx.now + timeout);
                }

                match cx.poll.take_outcome(token) {
                    None => {
                        self.state = State::Transferring {
                            token,
                            segment,
                            base_written,
                        };
                        Ok(Step::Done(TaskStatus::Queued))
                    }
                    Some(TransferOutcome::Completed { written }) => {
                        group.close_connection();
                        self.deadline = None;
                        segment.written = base_written + written;
                        let committed = group
                            .segments_mut()
                            .is_some_and(|s| s.complete_segment(&segment));
                        if !committed {
                            return Ok(Step::Done(TaskStatus::Terminated));
                        }
                        self.attempt = 0;
                        Ok(Step::Continue)
                    }
                    Some(TransferOutcome::Failed(e)) => {
                        group.close_connection();
                        Err(e)
                    }
                    Some(TransferOutcome::Headers(_)) => {
                        group.close_connection();
                        Err(DownloadError::fatal("range transfer returned only headers"))
                    }
                }
            }
        }
    }

    /// Release the transfer and the segment on halt.
    fn stop(&mut self, cx: &mut TaskContext<'_>) {
        let Some(group) = cx.registry.group_mut(self.gid) else {
            return;
        };
        let force = group.is_force_halt_requested();
        match std::mem::replace(&mut self.state, State::Acquire) {
            State::Sizing { token } => {
                cx.poll.cancel(token);
                group.close_connection();
            }
            State::Transferring {
                token,
                mut segment,
                base_written,
            } => {
                if !force {
                    segment.written = base_written + cx.poll.written(token);
                    if let Some(s) = group.segments_mut() {
                        s.update_segment(&segment);
                    }
                }
                cx.poll.cancel(token);
                group.close_connection();
            }
            State::Negotiate | State::Acquire | State::Throttled { .. } => {}
        }
        if let Some(s) = group.segments_mut() {
            s.cancel_segment(self.worker);
        }
        tracing::debug!(gid = %self.gid, worker = %self.worker, force, "connection stopped by halt");
    }

    /// Continue on another URI, or record the failure when none is left.
    fn switch_uri(&self, err: DownloadError, cx: &mut TaskContext<'_>) {
        let Some(group) = cx.registry.group_mut(self.gid) else {
            return;
        };
        group.drop_uri(&self.uri);
        match group.next_uri() {
            Some(uri) => {
                tracing::info!(gid = %self.gid, worker = %self.worker, %uri, "switching URI: {err}");
                cx.spawn(Box::new(ConnectionTask::negotiate(self.gid, self.worker, uri)));
            }
            None if group.connection_count() > 0 => {
                tracing::warn!(gid = %self.gid, worker = %self.worker, "giving up connection: {err}");
                group.record_error(err);
            }
            None => group.fail(err),
        }
    }
}

impl Task for ConnectionTask {
    fn name(&self) -> &'static str {
        "connection"
    }

    fn group(&self) -> Option<Gid> {
        Some(self.gid)
    }

    fn interest(&self) -> Interest {
        match self.state {
            State::Sizing { token } | State::Transferring { token, .. } => Interest::Transfer(token),
            State::Throttled { until } => Interest::Timer(until),
            State::Negotiate | State::Acquire => Interest::Always,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn execute(&mut self, cx: &mut TaskContext<'_>) -> Result<TaskStatus, DownloadError> {
        let halted = cx
            .registry
            .group(self.gid)
            .map_or(true, |g| g.is_halt_requested());
        if halted {
            self.stop(cx);
            return Ok(TaskStatus::Terminated);
        }
        loop {
            match self.step(cx)? {
                Step::Continue => continue,
                Step::Done(status) => return Ok(status),
            }
        }
    }

    fn handle_error(&mut self, err: DownloadError, cx: &mut TaskContext<'_>) -> TaskStatus {
        let state = std::mem::replace(&mut self.state, State::Acquire);
        self.deadline = None;
        let Some(group) = cx.registry.group_mut(self.gid) else {
            return TaskStatus::Terminated;
        };
        match state {
            State::Sizing { token } => {
                cx.poll.cancel(token);
                group.close_connection();
            }
            State::Transferring {
                token,
                mut segment,
                base_written,
            } => {
                segment.written = base_written + cx.poll.written(token);
                if let Some(s) = group.segments_mut() {
                    s.update_segment(&segment);
                }
                cx.poll.cancel(token);
                group.close_connection();
            }
            State::Negotiate | State::Acquire | State::Throttled { .. } => {}
        }
        if let Some(s) = group.segments_mut() {
            s.cancel_segment(self.worker);
        }
        if group.is_halt_requested() {
            return TaskStatus::Terminated;
        }

        match err.kind() {
            Kind::Retry => {
                self.attempt += 1;
                match cx.config.retry_policy().decide(self.attempt, err.retry_kind()) {
                    RetryDecision::RetryAfter(delay) => {
                        tracing::warn!(
                            gid = %self.gid,
                            worker = %self.worker,
                            attempt = self.attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying: {err}"
                        );
                        let next_state = if group.segments().is_some() {
                            State::Acquire
                        } else {
                            State::Negotiate
                        };
                        let mut next =
                            ConnectionTask::with_state(self.gid, self.worker, self.uri.clone(), next_state);
                        next.attempt = self.attempt;
                        cx.spawn(Box::new(SleepTask::new(
                            Some(self.gid),
                            cx.now + delay,
                            Box::new(next),
                        )));
                    }
                    RetryDecision::NoRetry => self.switch_uri(err, cx),
                }
            }
            Kind::AbortGroup if err.code() == ResultCode::ResourceNotFound => {
                if group.record_file_not_found() {
                    group.fail(err);
                } else {
                    self.switch_uri(err, cx);
                }
            }
            Kind::AbortGroup | Kind::Fatal => group.fail(err),
        }
        TaskStatus::Terminated
    }
}
