//! # Pacer Scheduler
//!
//! Per-channel control loop for outbound attempts.
//!
//! ## Architecture
//! ```text
//! ChannelScheduler (tokio loop, one per channel)
//!   ├── IntervalScheduler: jittered deadline, re-armed after each attempt
//!   ├── ManualTrigger / OpeningMailbox / MessagePool: operator requests
//!   └── AttemptGate → admit?
//!         ├── LifecycleStore: single in-flight slot
//!         ├── ActiveWindowPolicy: days + HH:MM-HH:MM
//!         └── AttemptLedger: hourly / daily caps per destination
//!
//! Provider callbacks → LifecycleStore → HistorySink (HistoryDb, SQLite)
//! ```

pub mod dialog;
pub mod engine;
pub mod gate;
pub mod interval;
pub mod ledger;
pub mod lifecycle;
pub mod messages;
pub mod params;
pub mod persistence;
pub mod trigger;
pub mod window;

pub use dialog::{DialogScript, DialogTurn, FollowUpResponder};
pub use engine::{
    Cause, ChannelScheduler, CycleOutcome, DenialRecord, StatusEffect, StatusNotification,
    StatusSnapshot, spawn_scheduler,
};
pub use gate::{AttemptGate, Decision, DenialReason, Diagnostics, ErrorCategory, callback_warnings};
pub use interval::{IntervalScheduler, ScheduleSnapshot, ScheduleState};
pub use ledger::{AttemptLedger, RateCheck};
pub use lifecycle::{
    BeginOutcome, CompleteOutcome, LifecycleStore, PENDING_TTL_SECS, Participants, Slot,
};
pub use messages::{MAX_MESSAGES, MessagePool};
pub use params::ParamSelector;
pub use persistence::{AttemptSummary, HistoryDb, HistoryMetrics};
pub use trigger::{ManualTrigger, OpeningMailbox};
pub use window::ActiveWindowPolicy;
