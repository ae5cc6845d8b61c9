//! # Pacer Providers
//!
//! Placement clients. The scheduler only sees the `Placement` trait; this
//! crate supplies the REST implementation built from `[provider]` config.

pub mod rest;

use std::sync::Arc;

use pacer_core::PacerConfig;
use pacer_core::error::Result;
use pacer_core::traits::Placement;

pub use rest::RestPlacement;

/// Create the placement client from configuration.
///
/// Missing credentials still yield a client; it reports itself as not
/// configured and the gate keeps every attempt out.
pub fn create_placement(config: &PacerConfig) -> Result<Arc<dyn Placement>> {
    let client = RestPlacement::new(&config.provider)?;
    if !client.is_configured() {
        tracing::warn!("⚠️ Provider credentials missing; placements are disabled");
    }
    Ok(Arc::new(client))
}
