//! Per-attempt parameter assignment: origin, persona, dialog variant, message body.

use std::sync::{Mutex, PoisonError};

use pacer_core::config::{ChannelSettings, DialogConfig};
use pacer_core::{AssignedParams, Channel};
use rand::seq::SliceRandom;

const SMS_MAX_CHARS: usize = 500;

#[derive(Default)]
struct Rotation {
    placed: u64,
    last_variant: Option<usize>,
}

/// Chooses the parameters fixed on an attempt at placement time.
pub struct ParamSelector {
    channel: Channel,
    origin: String,
    origin_pool: Vec<String>,
    personas: Vec<String>,
    variant_count: usize,
    template: String,
    company_name: String,
    topic: String,
    rotation: Mutex<Rotation>,
}

impl ParamSelector {
    pub fn new(
        channel: Channel,
        settings: &ChannelSettings,
        dialog: &DialogConfig,
        variant_count: usize,
    ) -> Self {
        Self {
            channel,
            origin: settings.origin.clone(),
            origin_pool: settings.origin_pool.clone(),
            personas: dialog.personas.clone(),
            variant_count,
            template: settings.template.clone(),
            company_name: dialog.company_name.clone(),
            topic: dialog.topic.clone(),
            rotation: Mutex::new(Rotation::default()),
        }
    }

    /// Random pick from the pool, else the single configured origin.
    pub fn choose_origin(&self) -> Option<String> {
        if let Some(o) = self.origin_pool.choose(&mut rand::thread_rng()) {
            return Some(o.clone());
        }
        if self.origin.is_empty() {
            None
        } else {
            Some(self.origin.clone())
        }
    }

    /// Deterministic origin for read-only checks.
    pub fn any_origin(&self) -> Option<String> {
        self.origin_pool
            .first()
            .cloned()
            .or_else(|| (!self.origin.is_empty()).then(|| self.origin.clone()))
    }

    pub fn default_persona(&self) -> Option<String> {
        self.personas.first().cloned()
    }

    /// Assign parameters for the next placement. `pooled` is an operator pool
    /// message: the voice opening when no one-shot text is queued, or the SMS
    /// body fallback after the template.
    pub fn assign(
        &self,
        origin: String,
        opening: Option<String>,
        pooled: Option<String>,
    ) -> AssignedParams {
        match self.channel {
            Channel::Voice => {
                let (persona, variant) = self.rotate();
                AssignedParams {
                    persona,
                    variant,
                    origin,
                    opening: opening.or(pooled),
                    body: None,
                }
            }
            Channel::Sms => {
                let body = self.compose_body(opening.as_deref(), pooled.as_deref());
                AssignedParams {
                    persona: None,
                    variant: None,
                    origin,
                    opening,
                    body: Some(body),
                }
            }
        }
    }

    fn rotate(&self) -> (Option<String>, Option<usize>) {
        let mut r = self.rotation.lock().unwrap_or_else(PoisonError::into_inner);
        r.placed += 1;
        let persona = if self.personas.is_empty() {
            None
        } else {
            let idx = ((r.placed - 1) % self.personas.len() as u64) as usize;
            Some(self.personas[idx].clone())
        };
        let variant = if self.variant_count == 0 {
            None
        } else {
            let next = r.last_variant.map(|v| (v + 1) % self.variant_count).unwrap_or(0);
            r.last_variant = Some(next);
            Some(next)
        };
        (persona, variant)
    }

    /// One-shot opening, then the template, then a pooled message, then a
    /// generic default.
    pub fn compose_body(&self, opening: Option<&str>, pooled: Option<&str>) -> String {
        if let Some(line) = opening.map(str::trim).filter(|l| !l.is_empty()) {
            return truncate(line, SMS_MAX_CHARS);
        }
        if !self.template.trim().is_empty() {
            let txt = self
                .template
                .replace("{company_name}", &self.company_name)
                .replace("{topic}", &self.topic);
            return truncate(txt.trim(), SMS_MAX_CHARS);
        }
        if let Some(line) = pooled.map(str::trim).filter(|l| !l.is_empty()) {
            return truncate(line, SMS_MAX_CHARS);
        }
        let mut parts = Vec::new();
        if !self.company_name.is_empty() {
            parts.push(format!("{}:", self.company_name));
        }
        if !self.topic.is_empty() {
            parts.push(format!("Regarding {}.", self.topic));
        }
        parts.push("Please reply when available.".to_string());
        truncate(&parts.join(" "), SMS_MAX_CHARS)
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
