//! Liveness accounting for one session.
//!
//! The monitor does not own a timer; the session worker calls [`check`]
//! on its own tick and acts on the returned [`Liveness`].
//!
//! [`check`]: HeartbeatMonitor::check

use std::time::{Duration, Instant};

use crate::constants::HEARTBEAT_MISS_THRESHOLD;

/// Result of a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// A heartbeat arrived within the last interval.
    Alive,
    /// Some intervals passed silently, but fewer than the threshold.
    Late { missed: u32 },
    /// The threshold was reached; the session must be torn down.
    Dead,
}

#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    last_seen: Instant,
}

impl HeartbeatMonitor {
    pub fn new(interval: Duration, now: Instant) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            last_seen: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Silence after which the session is dead.
    pub fn timeout(&self) -> Duration {
        self.interval * HEARTBEAT_MISS_THRESHOLD
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    /// Marks a heartbeat (or any other proof of life) at `now`.
    pub fn record(&mut self, now: Instant) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Whole intervals elapsed since the last heartbeat.
    pub fn missed(&self, now: Instant) -> u32 {
        let elapsed = now.saturating_duration_since(self.last_seen);
        (elapsed.as_millis() / self.interval.as_millis().max(1)) as u32
    }

    pub fn check(&self, now: Instant) -> Liveness {
        let elapsed = now.saturating_duration_since(self.last_seen);
        if elapsed >= self.timeout() {
            return Liveness::Dead;
        }
        match self.missed(now) {
            0 => Liveness::Alive,
            missed => Liveness::Late { missed },
        }
    }
}
