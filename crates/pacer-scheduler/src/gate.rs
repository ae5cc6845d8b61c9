//! Admission decision combining liveness, window, ledger, and readiness.

use std::sync::Arc;

use pacer_core::{Channel, Moment, Placement};
use serde::Serialize;

use crate::ledger::AttemptLedger;
use crate::lifecycle::{LifecycleStore, Slot};
use crate::window::ActiveWindowPolicy;

/// Broad class of a denial, as surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Configuration,
    RateLimited,
    WindowClosed,
    InFlight,
}

/// One reason an attempt was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenialReason {
    /// `sid` is `None` while the placement request is still outstanding.
    InFlight { sid: Option<String> },
    WindowClosed,
    RateLimited { retry_after_secs: u64 },
    MissingDestination,
    MissingOrigin,
    MissingCallbackBase,
    InvalidCallbackBase,
    ProviderNotConfigured,
    ChannelDisabled,
}

impl DenialReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InFlight { sid: Some(_) } => "already_in_progress",
            Self::InFlight { sid: None } => "placement_pending",
            Self::WindowClosed => "outside_active_window",
            Self::RateLimited { .. } => "cap_reached",
            Self::MissingDestination => "missing_destination",
            Self::MissingOrigin => "missing_origin",
            Self::MissingCallbackBase => "missing_public_base_url",
            Self::InvalidCallbackBase => "public_base_url_invalid",
            Self::ProviderNotConfigured => "provider_not_configured",
            Self::ChannelDisabled => "channel_disabled",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InFlight { .. } => ErrorCategory::InFlight,
            Self::WindowClosed => ErrorCategory::WindowClosed,
            Self::RateLimited { .. } => ErrorCategory::RateLimited,
            _ => ErrorCategory::Configuration,
        }
    }
}

/// Outcome of `AttemptGate::admit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub allow: bool,
    pub reasons: Vec<DenialReason>,
}

impl Decision {
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.reasons.iter().find_map(|r| match r {
            DenialReason::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        })
    }

    pub fn codes(&self) -> Vec<&'static str> {
        self.reasons.iter().map(DenialReason::code).collect()
    }
}

/// Static readiness, independent of time and liveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    pub ready: bool,
    pub reasons: Vec<&'static str>,
    /// Non-fatal callback URL concerns.
    pub warnings: Vec<&'static str>,
}

/// Single admission point for one channel.
pub struct AttemptGate {
    channel: Channel,
    enabled: bool,
    destination: String,
    callback_base: Option<String>,
    window: ActiveWindowPolicy,
    ledger: Arc<AttemptLedger>,
    lifecycle: Arc<LifecycleStore>,
    placement: Arc<dyn Placement>,
}

impl AttemptGate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel: Channel,
        enabled: bool,
        destination: &str,
        callback_base: Option<&str>,
        window: ActiveWindowPolicy,
        ledger: Arc<AttemptLedger>,
        lifecycle: Arc<LifecycleStore>,
        placement: Arc<dyn Placement>,
    ) -> Self {
        Self {
            channel,
            enabled,
            destination: destination.trim().to_string(),
            callback_base: callback_base
                .map(|b| b.trim().trim_end_matches('/').to_string())
                .filter(|b| !b.is_empty()),
            window,
            ledger,
            lifecycle,
            placement,
        }
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn callback_base(&self) -> Option<&str> {
        self.callback_base.as_deref()
    }

    pub fn window(&self) -> &ActiveWindowPolicy {
        &self.window
    }

    pub fn ledger(&self) -> &AttemptLedger {
        &self.ledger
    }

    /// Evaluate every check and collect all failing reasons.
    pub fn admit(&self, destination: &str, origin: Option<&str>, now: Moment) -> Decision {
        self.evaluate(destination, origin, now, true)
    }

    /// Same decision as `admit` without pruning the ledger.
    pub fn preview(&self, destination: &str, origin: Option<&str>, now: Moment) -> Decision {
        self.evaluate(destination, origin, now, false)
    }

    fn evaluate(&self, destination: &str, origin: Option<&str>, now: Moment, prune: bool) -> Decision {
        let mut reasons = Vec::new();

        match self.lifecycle.slot() {
            Slot::Idle => {}
            Slot::Pending { .. } => reasons.push(DenialReason::InFlight { sid: None }),
            Slot::InFlight { sid } => reasons.push(DenialReason::InFlight { sid: Some(sid) }),
        }

        if !self.window.is_open(now.local) {
            reasons.push(DenialReason::WindowClosed);
        }

        if !destination.is_empty() {
            let (allowed, retry_after_secs) = if prune {
                self.ledger.can_attempt(destination, now.epoch())
            } else {
                let check = self.ledger.peek(destination, now.epoch());
                (check.allowed, check.retry_after_secs)
            };
            if !allowed {
                reasons.push(DenialReason::RateLimited { retry_after_secs });
            }
        }

        reasons.extend(self.readiness(destination, origin));

        Decision {
            allow: reasons.is_empty(),
            reasons,
        }
    }

    /// Configuration checks shared by `admit` and `diagnostics`.
    fn readiness(&self, destination: &str, origin: Option<&str>) -> Vec<DenialReason> {
        let mut reasons = Vec::new();
        if !self.enabled {
            reasons.push(DenialReason::ChannelDisabled);
        }
        if destination.trim().is_empty() {
            reasons.push(DenialReason::MissingDestination);
        }
        if origin.map(str::trim).unwrap_or("").is_empty() {
            reasons.push(DenialReason::MissingOrigin);
        }
        match &self.callback_base {
            None => reasons.push(DenialReason::MissingCallbackBase),
            Some(base) => {
                if parse_callback_base(base).is_none() {
                    reasons.push(DenialReason::InvalidCallbackBase);
                }
            }
        }
        if !self.placement.is_configured() {
            reasons.push(DenialReason::ProviderNotConfigured);
        }
        reasons
    }

    /// Readiness plus callback URL warnings, for `check` and the status query.
    pub fn diagnostics(&self, origin: Option<&str>) -> Diagnostics {
        let reasons: Vec<&'static str> = self
            .readiness(&self.destination, origin)
            .iter()
            .map(DenialReason::code)
            .collect();
        let warnings = self
            .callback_base
            .as_deref()
            .map(callback_warnings)
            .unwrap_or_default();
        Diagnostics {
            ready: reasons.is_empty(),
            reasons,
            warnings,
        }
    }
}

fn parse_callback_base(base: &str) -> Option<url::Url> {
    let parsed = url::Url::parse(base).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host().is_none() {
        return None;
    }
    Some(parsed)
}

/// Hosts the provider cannot reach from the public internet.
pub fn callback_warnings(base: &str) -> Vec<&'static str> {
    let Some(parsed) = parse_callback_base(base) else {
        return vec!["public_base_url_invalid"];
    };
    let mut warnings = Vec::new();
    match parsed.host() {
        Some(url::Host::Domain(d)) if d.eq_ignore_ascii_case("localhost") => {
            warnings.push("public_base_url_is_localhost");
        }
        Some(url::Host::Ipv4(ip)) if ip.is_loopback() => {
            warnings.push("public_base_url_is_localhost");
        }
        Some(url::Host::Ipv4(ip)) if ip.is_private() => {
            warnings.push("public_base_url_is_private_lan");
        }
        Some(url::Host::Ipv6(ip)) if ip.is_loopback() => {
            warnings.push("public_base_url_is_localhost");
        }
        _ => {}
    }
    if parsed.scheme() == "http" {
        warnings.push("public_base_url_not_https");
    }
    warnings
}
