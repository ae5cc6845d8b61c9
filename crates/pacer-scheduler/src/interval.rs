//! Randomized inter-attempt interval and the single pending deadline.

use rand::Rng;
use std::sync::{Mutex, PoisonError};

/// Deadline state for one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleState {
    /// Epoch seconds of the next eligibility check.
    pub next_deadline: Option<i64>,
    /// Length of the current cycle, for progress display.
    pub interval_total: Option<u64>,
    pub initialized: bool,
}

/// Read-only view for the status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSnapshot {
    pub seconds_until_next: Option<u64>,
    pub interval_total: Option<u64>,
}

/// Jittered interval between `[min_secs, max_secs]`.
///
/// Bounds are expected to be normalized by configuration (floor applied,
/// `max >= min`); `new` still guards against inverted input.
pub struct IntervalScheduler {
    min_secs: u64,
    max_secs: u64,
    state: Mutex<ScheduleState>,
}

impl IntervalScheduler {
    pub fn new(min_secs: u64, max_secs: u64) -> Self {
        let min_secs = min_secs.max(1);
        Self {
            min_secs,
            max_secs: max_secs.max(min_secs),
            state: Mutex::new(ScheduleState::default()),
        }
    }

    pub fn bounds(&self) -> (u64, u64) {
        (self.min_secs, self.max_secs)
    }

    /// Uniform random interval, inclusive of both bounds.
    pub fn next_interval(&self) -> u64 {
        if self.min_secs == self.max_secs {
            return self.min_secs;
        }
        rand::thread_rng().gen_range(self.min_secs..=self.max_secs)
    }

    /// Start a new cycle at `now`. Returns the chosen interval.
    pub fn arm(&self, now: i64) -> u64 {
        let interval = self.next_interval();
        let mut state = self.lock();
        state.next_deadline = Some(now + interval as i64);
        state.interval_total = Some(interval);
        state.initialized = true;
        interval
    }

    /// Arm only on the very first call.
    pub fn initialize_if_needed(&self, now: i64) -> bool {
        if self.lock().initialized {
            return false;
        }
        self.arm(now);
        true
    }

    /// Clear the deadline; nothing is due until the next `arm`.
    pub fn disarm(&self) {
        let mut state = self.lock();
        state.next_deadline = None;
        state.interval_total = None;
        state.initialized = true;
    }

    pub fn is_due(&self, now: i64) -> bool {
        matches!(self.lock().next_deadline, Some(deadline) if now >= deadline)
    }

    pub fn state(&self) -> ScheduleState {
        *self.lock()
    }

    pub fn snapshot(&self, now: i64) -> ScheduleSnapshot {
        let state = self.lock();
        ScheduleSnapshot {
            seconds_until_next: state.next_deadline.map(|d| (d - now).max(0) as u64),
            interval_total: state.interval_total,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScheduleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
