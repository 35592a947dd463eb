//! Process-wide halt request, settable from a signal handler.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HaltStage {
    Running,
    /// Stop all groups, saving progress.
    Graceful,
    /// Stop immediately.
    Force,
}

/// Two-stage latch: the first [`signal`](HaltLatch::signal) requests a
/// graceful halt, the second a forced one. Stages only move forward.
#[derive(Debug, Clone, Default)]
pub struct HaltLatch {
    stage: Arc<AtomicU8>,
}

impl HaltLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance one stage and return the new one.
    pub fn signal(&self) -> HaltStage {
        let prev = self
            .stage
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |s| Some((s + 1).min(2)))
            .unwrap_or(2);
        Self::decode((prev + 1).min(2))
    }

    /// Jump straight to `stage` (never backwards).
    pub fn request(&self, stage: HaltStage) {
        self.stage.fetch_max(stage as u8, Ordering::SeqCst);
    }

    pub fn stage(&self) -> HaltStage {
        Self::decode(self.stage.load(Ordering::SeqCst))
    }

    fn decode(v: u8) -> HaltStage {
        match v {
            0 => HaltStage::Running,
            1 => HaltStage::Graceful,
            _ => HaltStage::Force,
        }
    }
}
