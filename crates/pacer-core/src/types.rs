//! Attempt, channel, and provider status types shared across crates.

use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::PacerError;

/// Outbound channel. Each channel runs its own scheduler instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Voice,
    Sms,
}

impl Channel {
    pub const ALL: [Channel; 2] = [Channel::Voice, Channel::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Voice => "voice",
            Channel::Sms => "sms",
        }
    }

    /// Lowest interval, in seconds, the scheduler will ever wait between attempts.
    pub fn min_interval_floor(&self) -> u64 {
        match self {
            Channel::Voice => 30,
            Channel::Sms => 60,
        }
    }

    /// Longest accepted one-shot opening text.
    pub fn opening_max_chars(&self) -> usize {
        match self {
            Channel::Voice => 150,
            Channel::Sms => 500,
        }
    }

    pub fn icon(&self) -> &'static str {
        match self {
            Channel::Voice => "📞",
            Channel::Sms => "✉️",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = PacerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "voice" | "call" | "calls" => Ok(Channel::Voice),
            "sms" | "text" | "texts" => Ok(Channel::Sms),
            other => Err(PacerError::InvalidInput(format!("unknown channel '{other}'"))),
        }
    }
}

/// Lifecycle state of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    PendingPlacement,
    InFlight,
    Completed,
    Failed,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Completed | AttemptState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::PendingPlacement => "pending_placement",
            AttemptState::InFlight => "in_flight",
            AttemptState::Completed => "completed",
            AttemptState::Failed => "failed",
        }
    }
}

/// Terminal outcome reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Completed,
    Failed,
}

impl From<Outcome> for AttemptState {
    fn from(o: Outcome) -> Self {
        match o {
            Outcome::Completed => AttemptState::Completed,
            Outcome::Failed => AttemptState::Failed,
        }
    }
}

/// Raw provider status as carried by status callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderStatus {
    Queued,
    Initiated,
    Ringing,
    InProgress,
    Answered,
    Completed,
    Busy,
    NoAnswer,
    Canceled,
    Failed,
    Accepted,
    Sending,
    Sent,
    Delivered,
    Undelivered,
    Other(String),
}

impl ProviderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().replace('_', "-").as_str() {
            "queued" => Self::Queued,
            "initiated" => Self::Initiated,
            "ringing" => Self::Ringing,
            "in-progress" => Self::InProgress,
            "answered" => Self::Answered,
            "completed" => Self::Completed,
            "busy" => Self::Busy,
            "no-answer" => Self::NoAnswer,
            "canceled" | "cancelled" => Self::Canceled,
            "failed" => Self::Failed,
            "accepted" => Self::Accepted,
            "sending" => Self::Sending,
            "sent" => Self::Sent,
            "delivered" => Self::Delivered,
            "undelivered" => Self::Undelivered,
            other => Self::Other(other.to_string()),
        }
    }

    /// Terminal outcome for this status, or `None` while the attempt is still live.
    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            Self::Completed | Self::Delivered => Some(Outcome::Completed),
            Self::Busy | Self::NoAnswer | Self::Canceled | Self::Failed | Self::Undelivered => {
                Some(Outcome::Failed)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Queued => "queued",
            Self::Initiated => "initiated",
            Self::Ringing => "ringing",
            Self::InProgress => "in-progress",
            Self::Answered => "answered",
            Self::Completed => "completed",
            Self::Busy => "busy",
            Self::NoAnswer => "no-answer",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
            Self::Accepted => "accepted",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Undelivered => "undelivered",
            Self::Other(s) => s.as_str(),
        }
    }
}

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Assistant,
    Callee,
    Provider,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Assistant => "assistant",
            Role::Callee => "callee",
            Role::Provider => "provider",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "assistant" => Role::Assistant,
            "callee" => Role::Callee,
            _ => Role::Provider,
        }
    }
}

/// One entry in an attempt's append-only event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub role: Role,
    pub text: String,
    pub is_final: bool,
}

/// Per-attempt parameters fixed at placement time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssignedParams {
    /// Synthesized voice persona (voice only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    /// Index into the dialog variant table (voice only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<usize>,
    pub origin: String,
    /// One-shot opening consumed for this attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opening: Option<String>,
    /// Composed message body (SMS only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// One placement of a call or message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    pub channel: Channel,
    pub sid: String,
    pub destination: String,
    pub origin: String,
    pub state: AttemptState,
    pub placed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<u64>,
    pub provider_status: Option<String>,
    pub params: Option<AssignedParams>,
    pub events: Vec<TranscriptEvent>,
    /// Call recordings reported by the provider.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recordings: Vec<RecordingEntry>,
}

impl Attempt {
    pub fn new(channel: Channel, sid: impl Into<String>) -> Self {
        Self {
            channel,
            sid: sid.into(),
            destination: String::new(),
            origin: String::new(),
            state: AttemptState::PendingPlacement,
            placed_at: None,
            completed_at: None,
            duration_secs: None,
            provider_status: None,
            params: None,
            events: Vec::new(),
            recordings: Vec::new(),
        }
    }

    /// Apply a recording status callback to this attempt.
    pub fn note_recording(&mut self, recording_sid: &str, status: &str, at: DateTime<Utc>) -> bool {
        apply_recording(&mut self.recordings, recording_sid, status, at)
    }

    /// Opening lines and replies the assistant produced, in order.
    pub fn assistant_lines(&self) -> impl Iterator<Item = &str> {
        self.events
            .iter()
            .filter(|e| e.role == Role::Assistant)
            .map(|e| e.text.as_str())
    }
}

/// One provider recording attached to an attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingEntry {
    pub recording_sid: String,
    pub status: String,
    pub at: DateTime<Utc>,
}

/// Merge a recording status into `recordings`. `in-progress` and `completed`
/// add an unseen recording; any other status only updates a known one. A
/// completed recording never moves back to in-progress.
pub fn apply_recording(
    recordings: &mut Vec<RecordingEntry>,
    recording_sid: &str,
    status: &str,
    at: DateTime<Utc>,
) -> bool {
    let status = status.trim().to_lowercase();
    let starts = matches!(status.as_str(), "in-progress" | "completed");
    if let Some(r) = recordings.iter_mut().find(|r| r.recording_sid == recording_sid) {
        if status == "in-progress" && r.status == "completed" {
            return false;
        }
        r.status = status;
        r.at = at;
        return true;
    }
    if !starts || recording_sid.trim().is_empty() {
        return false;
    }
    recordings.push(RecordingEntry {
        recording_sid: recording_sid.to_string(),
        status,
        at,
    });
    true
}

/// Most recent placement failure, kept for the status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastError {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Where the provider should report back for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackUrls {
    /// Voice only: fetched by the provider when the callee answers.
    pub entry: Option<String>,
    pub status: String,
    /// Voice only: partial speech results.
    pub partial: Option<String>,
    /// Voice only: recording status events.
    pub recording: Option<String>,
}

impl CallbackUrls {
    pub fn for_channel(base: &str, channel: Channel) -> Self {
        let base = base.trim_end_matches('/');
        match channel {
            Channel::Voice => Self {
                entry: Some(format!("{base}/hooks/voice/answer")),
                status: format!("{base}/hooks/voice/status"),
                partial: Some(format!("{base}/hooks/voice/partial")),
                recording: Some(format!("{base}/hooks/voice/recording")),
            },
            Channel::Sms => Self {
                entry: None,
                status: format!("{base}/hooks/sms/status"),
                partial: None,
                recording: None,
            },
        }
    }
}

/// Everything the placement action needs for one outbound attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacementRequest {
    pub channel: Channel,
    pub destination: String,
    pub origin: String,
    pub callbacks: CallbackUrls,
    pub body: Option<String>,
}

/// A point in time seen both as UTC and as local wall-clock time.
///
/// Ledger and lifecycle stamps use `utc`; active-window checks use `local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Moment {
    pub utc: DateTime<Utc>,
    pub local: NaiveDateTime,
}

impl Moment {
    pub fn now() -> Self {
        let utc = Utc::now();
        Self {
            utc,
            local: utc.with_timezone(&Local).naive_local(),
        }
    }

    /// Build a moment whose local wall-clock equals UTC.
    pub fn from_utc(utc: DateTime<Utc>) -> Self {
        Self {
            utc,
            local: utc.naive_utc(),
        }
    }

    pub fn epoch(&self) -> i64 {
        self.utc.timestamp()
    }

    pub fn plus_secs(&self, secs: i64) -> Self {
        let delta = chrono::Duration::seconds(secs);
        Self {
            utc: self.utc + delta,
            local: self.local + delta,
        }
    }
}
