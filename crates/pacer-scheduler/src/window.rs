//! Day-of-week and time-of-day admission window.

use chrono::{Datelike, NaiveDateTime, NaiveTime, Timelike, Weekday};

const DEFAULT_START: u32 = 9 * 60;
const DEFAULT_END: u32 = 18 * 60;

/// Parsed active window. Times are minutes after local midnight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveWindowPolicy {
    start: u32,
    end: u32,
    days: Vec<Weekday>,
}

impl ActiveWindowPolicy {
    /// Parse `"HH:MM-HH:MM"` and a list of day names.
    ///
    /// Malformed specs fall back to 09:00-18:00; unknown day names are dropped.
    /// An empty day list allows every day.
    pub fn new(spec: &str, days: &[String]) -> Self {
        let (start, end) = parse_span(spec).unwrap_or_else(|| {
            if !spec.trim().is_empty() {
                tracing::warn!("⚠️ Invalid active window '{spec}', using 09:00-18:00");
            }
            (DEFAULT_START, DEFAULT_END)
        });
        let mut parsed: Vec<Weekday> = Vec::new();
        for d in days.iter().filter_map(|d| parse_day(d)) {
            if !parsed.contains(&d) {
                parsed.push(d);
            }
        }
        Self { start, end, days: parsed }
    }

    /// Whether `now` (local wall-clock) is inside the window.
    pub fn is_open(&self, now: NaiveDateTime) -> bool {
        if !self.days.is_empty() && !self.days.contains(&now.weekday()) {
            return false;
        }
        self.contains_minute(minute_of_day(now.time()))
    }

    fn contains_minute(&self, minute: u32) -> bool {
        if self.start <= self.end {
            self.start <= minute && minute <= self.end
        } else {
            minute >= self.start || minute <= self.end
        }
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }

    pub fn days(&self) -> &[Weekday] {
        &self.days
    }

    /// Canonical `HH:MM-HH:MM` form.
    pub fn span(&self) -> String {
        format!(
            "{:02}:{:02}-{:02}:{:02}",
            self.start / 60,
            self.start % 60,
            self.end / 60,
            self.end % 60
        )
    }
}

fn minute_of_day(t: NaiveTime) -> u32 {
    t.hour() * 60 + t.minute()
}

fn parse_span(spec: &str) -> Option<(u32, u32)> {
    let (a, b) = spec.trim().split_once('-')?;
    Some((parse_hhmm(a)?, parse_hhmm(b)?))
}

fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    let h: u32 = h.trim().parse().ok()?;
    let m: u32 = m.trim().parse().ok()?;
    if h > 23 || m > 59 {
        return None;
    }
    Some(h * 60 + m)
}

/// Accepts `mon`, `monday`, `tue`, `tues`, `tuesday`, ... case-insensitively.
pub fn parse_day(name: &str) -> Option<Weekday> {
    let n = name.trim().to_lowercase();
    let day = match n.as_str() {
        "mon" | "monday" => Weekday::Mon,
        "tue" | "tues" | "tuesday" => Weekday::Tue,
        "wed" | "weds" | "wednesday" => Weekday::Wed,
        "thu" | "thur" | "thurs" | "thursday" => Weekday::Thu,
        "fri" | "friday" => Weekday::Fri,
        "sat" | "saturday" => Weekday::Sat,
        "sun" | "sunday" => Weekday::Sun,
        _ => return None,
    };
    Some(day)
}
