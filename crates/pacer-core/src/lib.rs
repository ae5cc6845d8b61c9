//! # Pacer Core
//!
//! Shared vocabulary for the Pacer workspace: channel and attempt types,
//! the placement / history / responder seams, the error type, and the
//! TOML configuration model.

pub mod config;
pub mod error;
pub mod mask;
pub mod traits;
pub mod types;

pub use config::PacerConfig;
pub use error::{PacerError, Result};
pub use traits::{HistorySink, Placement, Responder};
pub use types::{
    AssignedParams, Attempt, AttemptState, CallbackUrls, Channel, LastError, Moment, Outcome,
    PlacementRequest, ProviderStatus, RecordingEntry, Role, TranscriptEvent, apply_recording,
};
