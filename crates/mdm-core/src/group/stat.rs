//! Transfer statistics: sliding-window speed and per-session totals.

use std::collections::VecDeque;
use std::ops::AddAssign;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(10);

/// Bytes received over the last few seconds plus a session total.
///
/// `speed` is the rate over the window; `average_speed` the rate since the
/// first recorded byte.
#[derive(Debug, Clone, Default)]
pub struct SpeedMeter {
    samples: VecDeque<(Instant, u64)>,
    session_start: Option<Instant>,
    session_bytes: u64,
}

impl SpeedMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, now: Instant, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.session_start.get_or_insert(now);
        self.session_bytes += bytes;
        self.samples.push_back((now, bytes));
        self.expire(now);
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Bytes per second over the window (0 with fewer than one second of data).
    pub fn speed(&self, now: Instant) -> u64 {
        let Some(&(oldest, _)) = self.samples.front() else {
            return 0;
        };
        let span = now.saturating_duration_since(oldest).max(Duration::from_secs(1));
        if span > WINDOW + Duration::from_secs(1) {
            return 0;
        }
        let bytes: u64 = self
            .samples
            .iter()
            .filter(|(t, _)| now.saturating_duration_since(*t) <= WINDOW)
            .map(|(_, b)| b)
            .sum();
        (bytes as f64 / span.as_secs_f64()) as u64
    }

    pub fn average_speed(&self, now: Instant) -> u64 {
        match self.session_start {
            Some(start) => {
                let secs = now.saturating_duration_since(start).as_secs_f64().max(1.0);
                (self.session_bytes as f64 / secs) as u64
            }
            None => 0,
        }
    }

    pub fn session_bytes(&self) -> u64 {
        self.session_bytes
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Progress of one connection since it began transferring.
#[derive(Debug, Clone)]
pub struct WorkerStat {
    started: Instant,
    meter: SpeedMeter,
}

impl WorkerStat {
    pub fn new(now: Instant) -> Self {
        Self {
            started: now,
            meter: SpeedMeter::new(),
        }
    }

    pub fn record(&mut self, now: Instant, bytes: u64) {
        self.meter.record(now, bytes);
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started)
    }

    pub fn speed(&self, now: Instant) -> u64 {
        self.meter.speed(now)
    }

    pub fn average_speed(&self, now: Instant) -> u64 {
        self.meter.average_speed(now)
    }
}

/// Read-only snapshot of transfer progress for one group or the sum of all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStat {
    pub download_speed: u64,
    pub upload_speed: u64,
    pub session_download_length: u64,
    pub session_upload_length: u64,
}

impl AddAssign for TransferStat {
    fn add_assign(&mut self, rhs: Self) {
        self.download_speed += rhs.download_speed;
        self.upload_speed += rhs.upload_speed;
        self.session_download_length += rhs.session_download_length;
        self.session_upload_length += rhs.session_upload_length;
    }
}
