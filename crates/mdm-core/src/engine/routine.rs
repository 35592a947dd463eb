//! Tasks that serve the engine rather than one connection.

use std::time::{Duration, Instant};

use crate::chunked::{ChunkedKind, TaskQueueManager};
use crate::error::DownloadError;
use crate::group::DownloadGroup;
use crate::registry::Gid;

use super::task::{Interest, Task, TaskContext, TaskStatus};

/// Holds `inner` back until `wake`, then hands it to the scheduler.
///
/// Used for retry backoff. If the group is halted in the meantime the inner
/// task is dropped without running.
#[derive(Debug)]
pub struct SleepTask {
    gid: Option<Gid>,
    wake: Instant,
    inner: Option<Box<dyn Task>>,
}

impl SleepTask {
    pub fn new(gid: Option<Gid>, wake: Instant, inner: Box<dyn Task>) -> Self {
        Self {
            gid,
            wake,
            inner: Some(inner),
        }
    }
}

impl Task for SleepTask {
    fn name(&self) -> &'static str {
        "sleep"
    }

    fn group(&self) -> Option<Gid> {
        self.gid
    }

    fn interest(&self) -> Interest {
        Interest::Timer(self.wake)
    }

    fn execute(&mut self, cx: &mut TaskContext<'_>) -> Result<TaskStatus, DownloadError> {
        let live = match self.gid {
            Some(gid) => cx
                .registry
                .group(gid)
                .is_some_and(|g| !g.is_halt_requested()),
            None => true,
        };
        if live && cx.now < self.wake {
            return Ok(TaskStatus::Queued);
        }
        if let Some(inner) = self.inner.take() {
            if live {
                cx.spawn(inner);
            } else {
                tracing::debug!(task = inner.name(), "dropping sleeping task of halted group");
            }
        }
        Ok(TaskStatus::Terminated)
    }
}

/// Drives one chunked queue: a single group's disk operation advances one
/// slice per tick while the others wait.
#[derive(Debug)]
pub struct ChunkedQueueTask {
    kind: ChunkedKind,
}

enum Slice {
    Pending,
    Finished(Result<(), DownloadError>),
    /// Nothing left to do for this entry.
    Gone,
}

impl ChunkedQueueTask {
    pub fn new(kind: ChunkedKind) -> Self {
        Self { kind }
    }

    fn advance(group: &mut DownloadGroup) -> Slice {
        if group.is_halt_requested() {
            group.take_chunked();
            return Slice::Gone;
        }
        let Some(task) = group.chunked_mut() else {
            return Slice::Gone;
        };
        match task.advance() {
            Err(e) => Slice::Finished(Err(e)),
            Ok(()) if task.is_done() => Slice::Finished(task.outcome()),
            Ok(()) => Slice::Pending,
        }
    }

    /// Apply the verdict of a finished operation to its group.
    fn finish(
        kind: ChunkedKind,
        group: &mut DownloadGroup,
        verdict: Result<(), DownloadError>,
        spawned: &mut Vec<Box<dyn Task>>,
    ) {
        group.take_chunked();
        match (kind, verdict) {
            (ChunkedKind::FileAllocation, Ok(())) => {
                tracing::debug!(gid = %group.gid(), "file allocation finished");
                let n = group.extra_connections() + 1;
                spawned.extend(group.create_transfer_tasks(n));
            }
            (ChunkedKind::IntegrityCheck, Ok(())) => group.set_verified(),
            (ChunkedKind::IntegrityCheck, Err(e)) => {
                group.discard_progress();
                group.fail(e);
            }
            (ChunkedKind::FileAllocation, Err(e)) => group.fail(e),
        }
    }
}

impl Task for ChunkedQueueTask {
    fn name(&self) -> &'static str {
        match self.kind {
            ChunkedKind::FileAllocation => "file-allocation",
            ChunkedKind::IntegrityCheck => "integrity-check",
        }
    }

    fn execute(&mut self, cx: &mut TaskContext<'_>) -> Result<TaskStatus, DownloadError> {
        let queue: &mut TaskQueueManager<Gid> = match self.kind {
            ChunkedKind::FileAllocation => &mut *cx.file_allocation,
            ChunkedKind::IntegrityCheck => &mut *cx.integrity_check,
        };
        let registry = &mut *cx.registry;
        let mut released = Vec::new();
        let mut spawned = Vec::new();

        queue.retain_waiting(|gid| {
            let live = registry
                .group(*gid)
                .is_some_and(|g| !g.is_halt_requested());
            if !live {
                released.push(*gid);
            }
            live
        });

        let picked = match queue.picked() {
            Some(gid) => Some(*gid),
            None => queue.pop_next_task().copied(),
        };
        if let Some(gid) = picked {
            let slice = match registry.group_mut(gid) {
                Some(group) => match Self::advance(group) {
                    Slice::Finished(verdict) => {
                        Self::finish(self.kind, group, verdict, &mut spawned);
                        Slice::Gone
                    }
                    other => other,
                },
                None => Slice::Gone,
            };
            if !matches!(slice, Slice::Pending) {
                queue.drop_picked_task();
                released.push(gid);
            }
        }

        let busy = !queue.is_empty();
        for gid in released {
            if let Some(group) = registry.group_mut(gid) {
                group.dec_task_refs();
            }
        }
        for task in spawned {
            cx.spawn(task);
        }
        if busy {
            cx.set_no_wait();
            return Ok(TaskStatus::Queued);
        }
        if cx.registry.is_finished() {
            return Ok(TaskStatus::Terminated);
        }
        Ok(TaskStatus::Queued)
    }
}

/// Persists every active group's progress on a fixed interval.
#[derive(Debug)]
pub struct AutoSaveTask {
    interval: Duration,
    next: Instant,
}

impl AutoSaveTask {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval,
            next: now + interval,
        }
    }
}

impl Task for AutoSaveTask {
    fn name(&self) -> &'static str {
        "auto-save"
    }

    fn interest(&self) -> Interest {
        Interest::Timer(self.next)
    }

    fn execute(&mut self, cx: &mut TaskContext<'_>) -> Result<TaskStatus, DownloadError> {
        if cx.registry.is_finished() {
            return Ok(TaskStatus::Terminated);
        }
        if cx.now >= self.next {
            cx.registry.save_all();
            self.next = cx.now + self.interval;
        }
        Ok(TaskStatus::Queued)
    }
}
