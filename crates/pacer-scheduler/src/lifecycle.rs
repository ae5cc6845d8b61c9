//! SID-keyed attempt state for one channel.
//!
//! The store owns the channel's single in-flight slot. Records live in memory
//! from placement until their terminal callback, are handed to the history
//! sink, and are evicted only after the sink returns.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use pacer_core::mask::{mask_phone, mask_sid};
use pacer_core::{
    AssignedParams, Attempt, AttemptState, Channel, HistorySink, Outcome, Role, TranscriptEvent,
};

const RECENT_CAPACITY: usize = 256;

/// Seconds a placement reservation holds the slot without a sid.
pub const PENDING_TTL_SECS: i64 = 30;

/// Occupancy of the channel's single in-flight slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Idle,
    /// Placement request is with the provider; no sid yet.
    Pending { since: DateTime<Utc> },
    InFlight { sid: String },
}

/// Addresses carried by a provider callback.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Participants {
    pub destination: Option<String>,
    pub origin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BeginOutcome {
    /// The attempt now holds the in-flight slot.
    Claimed,
    /// Same sid already tracked; empty fields were filled.
    AlreadyTracked,
    /// Another sid holds the slot; the record is kept as pending.
    Conflict { current: String },
    /// The sid completed recently; ignored.
    AlreadyCompleted,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompleteOutcome {
    Completed(Attempt),
    /// Terminal callback for an unknown sid; a minimal record was persisted.
    Recovered(Attempt),
    /// Repeat terminal callback; only the remembered timestamp moved.
    Duplicate,
}

#[derive(Debug, Clone)]
struct Tombstone {
    sid: String,
    completed_at: DateTime<Utc>,
}

struct Inner {
    slot: Slot,
    live: HashMap<String, Attempt>,
    recent: VecDeque<Tombstone>,
}

impl Inner {
    fn is_recent(&self, sid: &str) -> bool {
        self.recent.iter().any(|t| t.sid == sid)
    }

    fn try_claim(&mut self, sid: &str) -> bool {
        let free = match &self.slot {
            Slot::Idle | Slot::Pending { .. } => true,
            Slot::InFlight { sid: held } => held == sid,
        };
        if free {
            self.slot = Slot::InFlight { sid: sid.to_string() };
            if let Some(a) = self.live.get_mut(sid) {
                a.state = AttemptState::InFlight;
            }
        }
        free
    }

    /// Look up a live record, creating a minimal one for an unseen sid.
    fn ensure(&mut self, channel: Channel, sid: &str) -> bool {
        if self.live.contains_key(sid) {
            return false;
        }
        self.live.insert(sid.to_string(), Attempt::new(channel, sid));
        true
    }
}

/// Live attempt state for one channel.
pub struct LifecycleStore {
    channel: Channel,
    sink: Arc<dyn HistorySink>,
    inner: Mutex<Inner>,
}

impl LifecycleStore {
    pub fn new(channel: Channel, sink: Arc<dyn HistorySink>) -> Self {
        Self {
            channel,
            sink,
            inner: Mutex::new(Inner {
                slot: Slot::Idle,
                live: HashMap::new(),
                recent: VecDeque::new(),
            }),
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve the slot while a placement request is outstanding.
    pub fn mark_pending(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        if inner.slot != Slot::Idle {
            return false;
        }
        inner.slot = Slot::Pending { since: now };
        true
    }

    /// Release a pending reservation. A slot already claimed by a sid is kept.
    pub fn clear_pending(&self) {
        let mut inner = self.lock();
        if matches!(inner.slot, Slot::Pending { .. }) {
            inner.slot = Slot::Idle;
        }
    }

    /// Release a reservation older than `PENDING_TTL_SECS`.
    pub fn expire_stale_pending(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.lock();
        let Slot::Pending { since } = inner.slot else {
            return false;
        };
        if (now - since).num_seconds() < PENDING_TTL_SECS {
            return false;
        }
        inner.slot = Slot::Idle;
        tracing::warn!(
            "⚠️ [{}] placement reservation from {} expired without a sid",
            self.channel,
            since.to_rfc3339()
        );
        true
    }

    pub fn slot(&self) -> Slot {
        self.lock().slot.clone()
    }

    /// True while an attempt is in flight or a placement is pending.
    pub fn is_busy(&self) -> bool {
        self.lock().slot != Slot::Idle
    }

    pub fn current_in_flight(&self) -> Option<String> {
        match &self.lock().slot {
            Slot::InFlight { sid } => Some(sid.clone()),
            _ => None,
        }
    }

    /// Number of live records in `in_flight` state. Never exceeds one.
    pub fn in_flight_count(&self) -> usize {
        self.lock()
            .live
            .values()
            .filter(|a| a.state == AttemptState::InFlight)
            .count()
    }

    /// Track a placed attempt. Idempotent; populated fields keep their first value.
    pub fn begin(
        &self,
        sid: &str,
        destination: &str,
        origin: &str,
        params: Option<AssignedParams>,
        now: DateTime<Utc>,
    ) -> BeginOutcome {
        let mut inner = self.lock();
        if inner.is_recent(sid) {
            return BeginOutcome::AlreadyCompleted;
        }
        let created = inner.ensure(self.channel, sid);
        if let Some(a) = inner.live.get_mut(sid) {
            if a.state.is_terminal() {
                return BeginOutcome::AlreadyCompleted;
            }
            if a.destination.is_empty() {
                a.destination = destination.to_string();
            }
            if a.origin.is_empty() {
                a.origin = origin.to_string();
            }
            if a.params.is_none() {
                a.params = params;
            }
            if a.placed_at.is_none() {
                a.placed_at = Some(now);
            }
        }

        if inner.try_claim(sid) {
            if created {
                tracing::info!(
                    "{} Attempt in flight: {} → {}",
                    self.channel.icon(),
                    mask_sid(sid),
                    mask_phone(destination)
                );
                BeginOutcome::Claimed
            } else {
                BeginOutcome::AlreadyTracked
            }
        } else {
            let current = match &inner.slot {
                Slot::InFlight { sid } => sid.clone(),
                _ => String::new(),
            };
            tracing::warn!(
                "⚠️ [{}] {} reported while {} is in flight; tracking as pending",
                self.channel,
                mask_sid(sid),
                mask_sid(&current)
            );
            BeginOutcome::Conflict { current }
        }
    }

    /// Record the raw provider status on a live attempt.
    pub fn note_status(&self, sid: &str, status: &str) {
        let mut inner = self.lock();
        if let Some(a) = inner.live.get_mut(sid) {
            a.provider_status = Some(status.to_string());
        }
    }

    /// Append to the attempt's event log. Blank text and finished attempts are ignored.
    pub fn append_event(
        &self,
        sid: &str,
        role: Role,
        text: &str,
        is_final: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let text = text.trim();
        if text.is_empty() || sid.is_empty() {
            return false;
        }
        let mut inner = self.lock();
        if inner.is_recent(sid) {
            return false;
        }
        if inner.ensure(self.channel, sid) {
            tracing::debug!("[{}] event for unseen sid {}", self.channel, mask_sid(sid));
            inner.try_claim(sid);
        }
        let Some(a) = inner.live.get_mut(sid) else {
            return false;
        };
        if a.state.is_terminal() {
            return false;
        }
        let (seq, at) = match a.events.last() {
            Some(last) => (last.seq + 1, now.max(last.at)),
            None => (0, now),
        };
        a.events.push(TranscriptEvent {
            seq,
            at,
            role,
            text: text.to_string(),
            is_final,
        });
        true
    }

    /// Finish an attempt: stamp it, release the slot, persist, then evict.
    pub fn complete(
        &self,
        sid: &str,
        outcome: Outcome,
        now: DateTime<Utc>,
        duration_secs: Option<u64>,
        participants: &Participants,
    ) -> CompleteOutcome {
        let (snapshot, recovered) = {
            let mut inner = self.lock();
            if let Some(t) = inner.recent.iter_mut().find(|t| t.sid == sid) {
                t.completed_at = t.completed_at.max(now);
                return CompleteOutcome::Duplicate;
            }
            let recovered = inner.ensure(self.channel, sid);
            let Some(a) = inner.live.get_mut(sid) else {
                return CompleteOutcome::Duplicate;
            };
            if a.state.is_terminal() {
                return CompleteOutcome::Duplicate;
            }
            a.state = outcome.into();
            a.completed_at = Some(now);
            if duration_secs.is_some() {
                a.duration_secs = duration_secs;
            }
            if a.destination.is_empty() {
                a.destination = participants.destination.clone().unwrap_or_default();
            }
            if a.origin.is_empty() {
                a.origin = participants.origin.clone().unwrap_or_default();
            }
            let snapshot = a.clone();
            if matches!(&inner.slot, Slot::InFlight { sid: held } if held == sid) {
                inner.slot = Slot::Idle;
            }
            (snapshot, recovered)
        };

        if recovered {
            tracing::warn!(
                "⚠️ [{}] terminal status for unknown sid {}; persisting minimal record",
                self.channel,
                mask_sid(sid)
            );
        }
        if let Err(e) = self.sink.persist(&snapshot) {
            tracing::error!("❌ [{}] failed to persist {}: {e}", self.channel, mask_sid(sid));
        }

        {
            let mut inner = self.lock();
            inner.live.remove(sid);
            inner.recent.push_back(Tombstone {
                sid: sid.to_string(),
                completed_at: now,
            });
            while inner.recent.len() > RECENT_CAPACITY {
                inner.recent.pop_front();
            }
        }

        tracing::info!(
            "{} Attempt {} {} ({} events)",
            self.channel.icon(),
            mask_sid(sid),
            snapshot.state.as_str(),
            snapshot.events.len()
        );
        if recovered {
            CompleteOutcome::Recovered(snapshot)
        } else {
            CompleteOutcome::Completed(snapshot)
        }
    }

    /// Attach a recording status to an attempt. Live attempts carry it until
    /// completion; finished ones are updated in the history sink.
    pub fn note_recording(
        &self,
        sid: &str,
        recording_sid: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> bool {
        {
            let mut inner = self.lock();
            let finished = inner.is_recent(sid);
            match inner.live.get_mut(sid) {
                Some(a) if !a.state.is_terminal() => {
                    return a.note_recording(recording_sid, status, now);
                }
                None if !finished => {
                    tracing::debug!(
                        "[{}] recording {} for unseen sid {}",
                        self.channel,
                        mask_sid(recording_sid),
                        mask_sid(sid)
                    );
                    return false;
                }
                _ => {}
            }
        }
        match self.sink.persist_recording(sid, recording_sid, status, now) {
            Ok(changed) => changed,
            Err(e) => {
                tracing::error!(
                    "❌ [{}] failed to store recording for {}: {e}",
                    self.channel,
                    mask_sid(sid)
                );
                false
            }
        }
    }

    /// Snapshot of a live attempt.
    pub fn live(&self, sid: &str) -> Option<Attempt> {
        self.lock().live.get(sid).cloned()
    }

    /// Snapshot of the attempt holding the in-flight slot.
    pub fn live_current(&self) -> Option<Attempt> {
        let inner = self.lock();
        match &inner.slot {
            Slot::InFlight { sid } => inner.live.get(sid).cloned(),
            _ => None,
        }
    }

    pub fn params_for(&self, sid: &str) -> Option<AssignedParams> {
        self.lock().live.get(sid).and_then(|a| a.params.clone())
    }

    /// Completion time remembered for a recently finished sid.
    pub fn recently_completed_at(&self, sid: &str) -> Option<DateTime<Utc>> {
        self.lock()
            .recent
            .iter()
            .find(|t| t.sid == sid)
            .map(|t| t.completed_at)
    }
}
