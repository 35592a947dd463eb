use std::time::Instant;

use crate::chunked::{ChunkedKind, TaskQueueManager};
use crate::config::MdmConfig;
use crate::error::DownloadError;
use crate::registry::{Gid, GroupRegistry};
use crate::transfer::{EventPoll, TransferToken};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Run again on a later tick.
    Queued,
    /// Drop the task.
    Terminated,
}

/// When a task wants to be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Every tick.
    Always,
    /// When the transfer made progress or finished.
    Transfer(TransferToken),
    /// Once the instant has passed.
    Timer(Instant),
}

/// A step function driven by the [`Scheduler`](super::Scheduler).
///
/// `execute` does a bounded amount of work and returns; the task keeps its
/// own state between invocations. Errors never escape the scheduler: they
/// are routed to [`handle_error`](Task::handle_error).
pub trait Task: std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// The group this task works for. `None` for routine tasks.
    fn group(&self) -> Option<Gid> {
        None
    }

    fn interest(&self) -> Interest {
        Interest::Always
    }

    /// Past this instant the scheduler calls [`on_timeout`](Task::on_timeout)
    /// instead of `execute`.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    fn execute(&mut self, cx: &mut TaskContext<'_>) -> Result<TaskStatus, DownloadError>;

    fn on_timeout(&mut self, _cx: &mut TaskContext<'_>) -> Result<TaskStatus, DownloadError> {
        Err(DownloadError::retry(
            crate::retry::ErrorKind::Timeout,
            format!("{} timed out", self.name()),
        ))
    }

    /// Decide what an error means for the group. The default fails it.
    fn handle_error(&mut self, err: DownloadError, cx: &mut TaskContext<'_>) -> TaskStatus {
        let group = match self.group() {
            Some(gid) => cx.registry.group_mut(gid),
            None => None,
        };
        match group {
            Some(group) => group.fail(err),
            None => tracing::error!(task = self.name(), "task failed: {err}"),
        }
        TaskStatus::Terminated
    }
}

/// Everything a task may touch during one invocation.
pub struct TaskContext<'a> {
    pub registry: &'a mut GroupRegistry,
    pub poll: &'a mut dyn EventPoll,
    pub file_allocation: &'a mut TaskQueueManager<Gid>,
    pub integrity_check: &'a mut TaskQueueManager<Gid>,
    pub config: &'a MdmConfig,
    pub now: Instant,
    spawned: &'a mut Vec<Box<dyn Task>>,
    no_wait: &'a mut bool,
    wake_all: &'a mut bool,
}

impl<'a> TaskContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        registry: &'a mut GroupRegistry,
        poll: &'a mut dyn EventPoll,
        file_allocation: &'a mut TaskQueueManager<Gid>,
        integrity_check: &'a mut TaskQueueManager<Gid>,
        config: &'a MdmConfig,
        now: Instant,
        spawned: &'a mut Vec<Box<dyn Task>>,
        no_wait: &'a mut bool,
        wake_all: &'a mut bool,
    ) -> Self {
        Self {
            registry,
            poll,
            file_allocation,
            integrity_check,
            config,
            now,
            spawned,
            no_wait,
            wake_all,
        }
    }

    /// Queue a task; it first runs on the next tick.
    pub fn spawn(&mut self, task: Box<dyn Task>) {
        self.spawned.push(task);
    }

    /// Skip the readiness wait on the next tick.
    pub fn set_no_wait(&mut self) {
        *self.no_wait = true;
    }

    /// Invoke every task on the next tick regardless of its interest, so
    /// a task whose segment changed hands sees it without waiting for I/O.
    pub fn wake_all(&mut self) {
        *self.wake_all = true;
    }

    /// Queue `gid` for its chunked operation. The queue entry holds a task
    /// reference on the group until the queue drops it.
    pub fn enqueue_chunked(&mut self, gid: Gid, kind: ChunkedKind) {
        if let Some(group) = self.registry.group_mut(gid) {
            group.inc_task_refs();
        }
        match kind {
            ChunkedKind::FileAllocation => self.file_allocation.push_task(gid),
            ChunkedKind::IntegrityCheck => self.integrity_check.push_task(gid),
        }
        tracing::debug!(gid = %gid, ?kind, "queued chunked operation");
        *self.no_wait = true;
    }
}
