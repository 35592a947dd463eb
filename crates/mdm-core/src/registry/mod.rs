//! All download groups of a session: active, waiting, and finished results.
//!
//! A GID is in at most one of the three collections. Groups move
//! waiting → active through [`promote_waiting_groups`], bounded by the
//! concurrency ceiling, and active → finished through
//! [`remove_stopped_groups`] once no task references them. A paused active
//! group goes back to the front of the waiting queue instead.
//!
//! [`promote_waiting_groups`]: GroupRegistry::promote_waiting_groups
//! [`remove_stopped_groups`]: GroupRegistry::remove_stopped_groups

mod gid;
mod server_stat;

pub use gid::{Gid, GidGenerator, ParseGidError};
pub use server_stat::{HostKey, ServerStat, ServerStatMan};

use std::collections::VecDeque;
use std::path::Path;
use std::time::Instant;

use crate::config::MdmConfig;
use crate::engine::Task;
use crate::error::ResultCode;
use crate::group::{DownloadGroup, DownloadRequest, DownloadResult, DownloadStat, GroupOptions, TransferStat};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no download with GID {0}")]
    UnknownGid(Gid),
    #[error("GID {0} is already registered")]
    DuplicateGid(Gid),
    #[error("cannot {action} GID {gid}: {reason}")]
    Ineligible {
        gid: Gid,
        action: &'static str,
        reason: &'static str,
    },
}

/// Addressing mode of [`GroupRegistry::change_position`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    /// From the front of the queue.
    Set,
    /// Relative to the current position.
    Cur,
    /// Relative to the back of the queue.
    End,
}

#[derive(Debug)]
pub struct GroupRegistry {
    active: Vec<DownloadGroup>,
    waiting: VecDeque<DownloadGroup>,
    finished: Vec<DownloadResult>,
    gids: GidGenerator,
    max_concurrent: usize,
    halted: bool,
    server_stats: ServerStatMan,
}

impl GroupRegistry {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            active: Vec::new(),
            waiting: VecDeque::new(),
            finished: Vec::new(),
            gids: GidGenerator::new(),
            max_concurrent: max_concurrent.max(1),
            halted: false,
            server_stats: ServerStatMan::new(),
        }
    }

    pub fn next_gid(&mut self) -> Gid {
        self.gids.next()
    }

    /// Build a group for `request` and queue it.
    pub fn create_group(&mut self, request: DownloadRequest, cfg: &MdmConfig) -> Gid {
        let mut gid = self.next_gid();
        while self.contains(gid) {
            gid = self.next_gid();
        }
        let options = GroupOptions::from_config(cfg, request.split);
        self.waiting.push_back(DownloadGroup::new(gid, request, options));
        tracing::debug!(gid = %gid, "group queued");
        gid
    }

    fn contains(&self, gid: Gid) -> bool {
        self.group(gid).is_some() || self.finished.iter().any(|r| r.gid == gid)
    }

    pub fn add_waiting_group(&mut self, group: DownloadGroup) -> Result<(), RegistryError> {
        if self.contains(group.gid()) {
            return Err(RegistryError::DuplicateGid(group.gid()));
        }
        self.gids.observe(group.gid());
        self.waiting.push_back(group);
        Ok(())
    }

    /// Make `group` active right away, bypassing the ceiling. Returns its
    /// initial tasks for the scheduler.
    pub fn add_active_group(&mut self, mut group: DownloadGroup) -> Result<Vec<Box<dyn Task>>, RegistryError> {
        if self.contains(group.gid()) {
            return Err(RegistryError::DuplicateGid(group.gid()));
        }
        self.gids.observe(group.gid());
        let tasks: Vec<Box<dyn Task>> = group.create_initial_task().into_iter().collect();
        self.active.push(group);
        Ok(tasks)
    }

    pub fn group(&self, gid: Gid) -> Option<&DownloadGroup> {
        self.active
            .iter()
            .chain(self.waiting.iter())
            .find(|g| g.gid() == gid)
    }

    pub fn group_mut(&mut self, gid: Gid) -> Option<&mut DownloadGroup> {
        self.active
            .iter_mut()
            .chain(self.waiting.iter_mut())
            .find(|g| g.gid() == gid)
    }

    pub fn is_active(&self, gid: Gid) -> bool {
        self.active.iter().any(|g| g.gid() == gid)
    }

    /// Another active group than `except` writes to `path`.
    pub fn is_path_in_use(&self, path: &Path, except: Gid) -> bool {
        self.active
            .iter()
            .any(|g| g.gid() != except && g.path() == Some(path))
    }

    fn waiting_index(&self, gid: Gid) -> Option<usize> {
        self.waiting.iter().position(|g| g.gid() == gid)
    }

    /// A waiting group is closed with `Removed` at once; an active one is
    /// halted and reported once its tasks are gone.
    pub fn remove_group(&mut self, gid: Gid, now: Instant) -> Result<(), RegistryError> {
        if let Some(idx) = self.waiting_index(gid) {
            if let Some(mut group) = self.waiting.remove(idx) {
                group.set_removal_requested();
                let result = group.close(now);
                self.finished.push(result);
            }
            return Ok(());
        }
        let group = self
            .active
            .iter_mut()
            .find(|g| g.gid() == gid)
            .ok_or(RegistryError::UnknownGid(gid))?;
        group.set_removal_requested();
        group.set_halt_requested(true);
        Ok(())
    }

    /// Pausing an active group halts it; it returns to the front of the
    /// waiting queue once stopped.
    pub fn pause_group(&mut self, gid: Gid) -> Result<(), RegistryError> {
        if let Some(group) = self.active.iter_mut().find(|g| g.gid() == gid) {
            if group.is_halt_requested() {
                return Err(RegistryError::Ineligible {
                    gid,
                    action: "pause",
                    reason: "already halted",
                });
            }
            group.set_halt_requested(true);
            group.set_pause_requested(true);
            tracing::info!(gid = %gid, "pausing active group");
            return Ok(());
        }
        let idx = self.waiting_index(gid).ok_or(RegistryError::UnknownGid(gid))?;
        if let Some(group) = self.waiting.get_mut(idx) {
            group.set_pause_requested(true);
        }
        Ok(())
    }

    pub fn unpause_group(&mut self, gid: Gid) -> Result<(), RegistryError> {
        if self.is_active(gid) {
            return Err(RegistryError::Ineligible {
                gid,
                action: "unpause",
                reason: "not waiting",
            });
        }
        let idx = self.waiting_index(gid).ok_or(RegistryError::UnknownGid(gid))?;
        match self.waiting.get_mut(idx) {
            Some(group) if group.is_pause_requested() => {
                group.set_pause_requested(false);
                Ok(())
            }
            _ => Err(RegistryError::Ineligible {
                gid,
                action: "unpause",
                reason: "not paused",
            }),
        }
    }

    /// Move a waiting group. Out-of-range targets clamp to the front or the
    /// back. Returns the new index.
    pub fn change_position(&mut self, gid: Gid, offset: i64, mode: PositionMode) -> Result<usize, RegistryError> {
        let Some(cur) = self.waiting_index(gid) else {
            return Err(if self.is_active(gid) {
                RegistryError::Ineligible {
                    gid,
                    action: "move",
                    reason: "not waiting",
                }
            } else {
                RegistryError::UnknownGid(gid)
            });
        };
        let last = self.waiting.len() as i64 - 1;
        let target = match mode {
            PositionMode::Set => offset,
            PositionMode::Cur => (cur as i64).saturating_add(offset),
            PositionMode::End => last.saturating_add(offset),
        }
        .clamp(0, last) as usize;
        if let Some(group) = self.waiting.remove(cur) {
            self.waiting.insert(target, group);
        }
        Ok(target)
    }

    /// Move waiting groups to active up to the ceiling, skipping paused
    /// ones. Returns their initial tasks.
    pub fn promote_waiting_groups(&mut self) -> Vec<Box<dyn Task>> {
        let mut tasks: Vec<Box<dyn Task>> = Vec::new();
        if self.halted {
            return tasks;
        }
        while self.active.len() < self.max_concurrent {
            let Some(idx) = self.waiting.iter().position(|g| !g.is_pause_requested()) else {
                break;
            };
            let Some(mut group) = self.waiting.remove(idx) else {
                break;
            };
            let stats = &self.server_stats;
            group.sort_uris_by_key(|u| stats.rank(u));
            tracing::info!(gid = %group.gid(), active = self.active.len() + 1, "group promoted");
            tasks.extend(group.create_initial_task());
            self.active.push(group);
        }
        tasks
    }

    /// Reap active groups no task refers to any more.
    pub fn remove_stopped_groups(&mut self, now: Instant) {
        if self.active.iter().all(|g| g.task_refs() > 0) {
            return;
        }
        let (stopped, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.active)
            .into_iter()
            .partition(|g| g.task_refs() == 0);
        self.active = running;

        let mut requeue = Vec::new();
        for mut group in stopped {
            let paused = group.is_pause_requested()
                && !group.is_removal_requested()
                && !group.download_finished()
                && group.last_error().is_none();
            if paused {
                group.reset_for_requeue();
                tracing::info!(gid = %group.gid(), "paused group back to waiting");
                requeue.push(group);
                continue;
            }
            let result = group.close(now);
            self.record_server_stats(&group, &result);
            self.finished.push(result);
        }
        for group in requeue.into_iter().rev() {
            self.waiting.push_front(group);
        }
    }

    fn record_server_stats(&mut self, group: &DownloadGroup, result: &DownloadResult) {
        for uri in group.failed_uris() {
            self.server_stats.record_failure(uri);
        }
        if result.code == ResultCode::Finished {
            for uri in group.uris() {
                self.server_stats.record_success(uri, result.avg_speed);
            }
        }
    }

    /// Halt every active group and stop promoting.
    pub fn halt(&mut self, force: bool) {
        self.halted = true;
        for group in &mut self.active {
            if force {
                group.set_force_halt_requested(true);
            } else {
                group.set_halt_requested(true);
            }
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Takes effect on the next promotion pass.
    pub fn set_max_concurrent(&mut self, n: usize) {
        self.max_concurrent = n.max(1);
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// No active group and nothing left to promote.
    pub fn is_finished(&self) -> bool {
        self.active.is_empty() && (self.halted || self.waiting.iter().all(DownloadGroup::is_pause_requested))
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn active_gids(&self) -> Vec<Gid> {
        self.active.iter().map(DownloadGroup::gid).collect()
    }

    pub fn waiting_gids(&self) -> Vec<Gid> {
        self.waiting.iter().map(DownloadGroup::gid).collect()
    }

    pub fn server_stats(&self) -> &ServerStatMan {
        &self.server_stats
    }

    /// Sum of the active groups' transfer statistics.
    pub fn calculate_aggregate_stat(&self, now: Instant) -> TransferStat {
        let mut total = TransferStat::default();
        for group in &self.active {
            total += group.stat(now);
        }
        total
    }

    /// The active groups together receive faster than `limit` bytes per
    /// second. A zero limit never binds.
    pub fn overall_download_speed_exceeds(&self, limit: u64, now: Instant) -> bool {
        limit > 0 && self.calculate_aggregate_stat(now).download_speed > limit
    }

    pub fn download_stat(&self) -> DownloadStat {
        DownloadStat::from_results(&self.finished, self.waiting.len())
    }

    pub fn finished_results(&self) -> &[DownloadResult] {
        &self.finished
    }

    pub fn save_all(&self) {
        for group in &self.active {
            if let Err(e) = group.save_progress() {
                tracing::warn!(gid = %group.gid(), "saving progress failed: {e:#}");
            }
        }
    }
}
