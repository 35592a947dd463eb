use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::chunked::{ChunkedKind, TaskQueueManager};
use crate::config::MdmConfig;
use crate::registry::{Gid, GroupRegistry};
use crate::transfer::EventPoll;

use super::halt::{HaltLatch, HaltStage};
use super::routine::{AutoSaveTask, ChunkedQueueTask};
use super::task::{Interest, Task, TaskContext, TaskStatus};

/// Single-threaded cooperative loop over all tasks.
///
/// Each tick waits on the event poll (bounded by the nearest timer), then
/// invokes every eligible task once in FIFO order. Tasks spawned during a
/// tick run on the next one. The loop ends when no task is left and the
/// registry is finished.
pub struct Scheduler<P: EventPoll> {
    registry: GroupRegistry,
    poll: P,
    config: MdmConfig,
    tasks: VecDeque<Box<dyn Task>>,
    file_allocation: TaskQueueManager<Gid>,
    integrity_check: TaskQueueManager<Gid>,
    latch: HaltLatch,
    seen_stage: HaltStage,
    /// Skip the readiness wait on the next tick.
    no_wait: bool,
    /// Invoke every task on the next tick regardless of interest.
    wake_all: bool,
}

impl<P: EventPoll> Scheduler<P> {
    pub fn new(registry: GroupRegistry, poll: P, config: MdmConfig) -> Self {
        Self {
            registry,
            poll,
            config,
            tasks: VecDeque::new(),
            file_allocation: TaskQueueManager::new(),
            integrity_check: TaskQueueManager::new(),
            latch: HaltLatch::new(),
            seen_stage: HaltStage::Running,
            no_wait: false,
            wake_all: false,
        }
    }

    /// Share a latch with a signal handler.
    pub fn with_halt_latch(mut self, latch: HaltLatch) -> Self {
        self.latch = latch;
        self
    }

    pub fn halt_latch(&self) -> &HaltLatch {
        &self.latch
    }

    /// Add a task; it holds a reference on its group until it terminates.
    pub fn push_task(&mut self, task: Box<dyn Task>) {
        if let Some(gid) = task.group() {
            if let Some(group) = self.registry.group_mut(gid) {
                group.inc_task_refs();
            }
        }
        self.tasks.push_back(task);
    }

    pub fn registry(&self) -> &GroupRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut GroupRegistry {
        &mut self.registry
    }

    pub fn poll(&self) -> &P {
        &self.poll
    }

    pub fn poll_mut(&mut self) -> &mut P {
        &mut self.poll
    }

    pub fn into_registry(self) -> GroupRegistry {
        self.registry
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_done(&self) -> bool {
        self.tasks.is_empty() && self.registry.is_finished()
    }

    /// Install the routine tasks and tick until done.
    pub fn run(&mut self) {
        self.push_task(Box::new(ChunkedQueueTask::new(ChunkedKind::FileAllocation)));
        self.push_task(Box::new(ChunkedQueueTask::new(ChunkedKind::IntegrityCheck)));
        let interval = Duration::from_secs(self.config.auto_save_interval_secs);
        if !interval.is_zero() {
            self.push_task(Box::new(AutoSaveTask::new(interval, Instant::now())));
        }
        tracing::info!(
            active = self.registry.active_count(),
            waiting = self.registry.waiting_count(),
            "scheduler started"
        );
        while !self.is_done() {
            self.tick();
        }
        self.registry.save_all();
        tracing::info!("scheduler stopped");
    }

    /// One iteration: halt check, promotion, poll, then every eligible task once.
    pub fn tick(&mut self) {
        self.observe_halt();

        for task in self.registry.promote_waiting_groups() {
            self.push_task(task);
        }

        let timeout = self.poll_timeout(Instant::now());
        self.no_wait = false;
        if let Err(e) = self.poll.poll(timeout) {
            tracing::warn!("event poll failed: {e:#}");
        }

        let now = Instant::now();
        let wake_all = std::mem::take(&mut self.wake_all);
        let registry_finished = self.registry.is_finished();
        let mut spawned: Vec<Box<dyn Task>> = Vec::new();
        let batch = std::mem::take(&mut self.tasks);

        for mut task in batch {
            let halted = task
                .group()
                .and_then(|gid| self.registry.group(gid))
                .is_some_and(|g| g.is_halt_requested());
            let timed_out = task.deadline().is_some_and(|d| now >= d);
            let ready = match task.interest() {
                Interest::Always => true,
                Interest::Transfer(token) => self.poll.is_ready(token),
                Interest::Timer(at) => now >= at,
            };
            let routine_wakeup = task.group().is_none() && registry_finished;
            if !(wake_all || halted || timed_out || ready || routine_wakeup) {
                self.tasks.push_back(task);
                continue;
            }

            let mut cx = TaskContext::new(
                &mut self.registry,
                &mut self.poll,
                &mut self.file_allocation,
                &mut self.integrity_check,
                &self.config,
                now,
                &mut spawned,
                &mut self.no_wait,
                &mut self.wake_all,
            );
            let result = if timed_out && !halted {
                task.on_timeout(&mut cx)
            } else {
                task.execute(&mut cx)
            };
            let status = match result {
                Ok(status) => status,
                Err(err) => {
                    tracing::debug!(task = task.name(), "task error: {err}");
                    task.handle_error(err, &mut cx)
                }
            };
            match status {
                TaskStatus::Queued => self.tasks.push_back(task),
                TaskStatus::Terminated => {
                    if let Some(gid) = task.group() {
                        if let Some(group) = self.registry.group_mut(gid) {
                            group.dec_task_refs();
                        }
                    }
                }
            }
        }

        for task in spawned {
            self.push_task(task);
        }
        self.registry.remove_stopped_groups(Instant::now());
    }

    fn observe_halt(&mut self) {
        let stage = self.latch.stage();
        if stage <= self.seen_stage {
            return;
        }
        self.seen_stage = stage;
        let force = stage == HaltStage::Force;
        tracing::info!(force, "halt requested");
        self.registry.halt(force);
        self.wake_all = true;
    }

    fn poll_timeout(&self, now: Instant) -> Duration {
        if self.no_wait || self.wake_all {
            return Duration::ZERO;
        }
        let mut timeout = self.config.poll_timeout();
        for task in &self.tasks {
            if task.group().is_some() && task.interest() == Interest::Always {
                return Duration::ZERO;
            }
            let at = match (task.interest(), task.deadline()) {
                (Interest::Timer(t), Some(d)) => Some(t.min(d)),
                (Interest::Timer(t), None) => Some(t),
                (_, d) => d,
            };
            if let Some(at) = at {
                timeout = timeout.min(at.saturating_duration_since(now));
            }
        }
        timeout
    }
}
