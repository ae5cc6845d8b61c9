//! Per-destination sliding-window attempt counters.
//!
//! Timestamps are epoch seconds. Entries older than 24h are pruned on every
//! admission check; the status query reads through `peek` without pruning.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;

/// Result of an admission check against the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateCheck {
    pub allowed: bool,
    /// Seconds until another attempt may be admitted; 0 when allowed.
    pub retry_after_secs: u64,
    pub last_hour: u32,
    pub last_day: u32,
}

/// Hourly/daily attempt budget per destination.
pub struct AttemptLedger {
    hourly_max: u32,
    daily_max: u32,
    entries: Mutex<HashMap<String, Vec<i64>>>,
}

impl AttemptLedger {
    pub fn new(hourly_max: u32, daily_max: u32) -> Self {
        let hourly_max = hourly_max.max(1);
        Self {
            hourly_max,
            daily_max: daily_max.max(hourly_max),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn hourly_max(&self) -> u32 {
        self.hourly_max
    }

    pub fn daily_max(&self) -> u32 {
        self.daily_max
    }

    /// Record a successful placement.
    pub fn record(&self, destination: &str, at: i64) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let list = entries.entry(destination.to_string()).or_default();
        list.push(at);
        list.sort_unstable();
    }

    /// Prune, then decide whether another attempt to `destination` fits the budget.
    pub fn can_attempt(&self, destination: &str, now: i64) -> (bool, u64) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let cutoff = now - DAY;
        if let Some(list) = entries.get_mut(destination) {
            list.retain(|&t| t >= cutoff);
            if list.is_empty() {
                entries.remove(destination);
            }
        }
        let check = self.evaluate(entries.get(destination).map(Vec::as_slice).unwrap_or(&[]), now);
        (check.allowed, check.retry_after_secs)
    }

    /// Same decision as `can_attempt`, plus counts, without mutating the ledger.
    pub fn peek(&self, destination: &str, now: i64) -> RateCheck {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        self.evaluate(entries.get(destination).map(Vec::as_slice).unwrap_or(&[]), now)
    }

    fn evaluate(&self, list: &[i64], now: i64) -> RateCheck {
        let day: Vec<i64> = list.iter().copied().filter(|&t| t >= now - DAY).collect();
        let hour: Vec<i64> = day.iter().copied().filter(|&t| t >= now - HOUR).collect();
        let last_hour = hour.len() as u32;
        let last_day = day.len() as u32;

        if last_hour >= self.hourly_max {
            let oldest = hour.iter().copied().min().unwrap_or(now);
            let wait = (oldest + HOUR - now).max(1) as u64;
            return RateCheck { allowed: false, retry_after_secs: wait, last_hour, last_day };
        }
        if last_day >= self.daily_max {
            return RateCheck { allowed: false, retry_after_secs: HOUR as u64, last_hour, last_day };
        }
        RateCheck { allowed: true, retry_after_secs: 0, last_hour, last_day }
    }
}
