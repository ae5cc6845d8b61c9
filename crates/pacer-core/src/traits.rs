//! Seams between the scheduler core and its external collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Attempt, PlacementRequest};

/// Provider-facing action that places one outbound call or message.
#[async_trait]
pub trait Placement: Send + Sync {
    /// Provider name, for logs and status output.
    fn name(&self) -> &str;

    /// Whether credentials are present. Unconfigured providers are never called.
    fn is_configured(&self) -> bool {
        true
    }

    /// Place the attempt and return the provider-assigned sid.
    async fn place(&self, request: &PlacementRequest) -> Result<String>;
}

/// Durable sink for completed attempts.
///
/// `persist` is invoked exactly once per completed attempt, before the
/// attempt is evicted from live memory.
pub trait HistorySink: Send + Sync {
    fn persist(&self, attempt: &Attempt) -> Result<()>;

    /// Attach a recording status to an attempt that was already persisted.
    /// Returns whether a stored attempt changed.
    fn persist_recording(
        &self,
        _sid: &str,
        _recording_sid: &str,
        _status: &str,
        _at: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(false)
    }
}

/// Deterministic reply generator consumed by the dialog-turn handler.
pub trait Responder: Send + Sync {
    fn respond(&self, text: &str) -> String;
}
