//! Pacer configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{PacerError, Result};
use crate::types::Channel;

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacerConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub dialog: DialogConfig,
    #[serde(default = "ChannelSettings::voice_defaults")]
    pub voice: ChannelSettings,
    #[serde(default = "ChannelSettings::sms_defaults")]
    pub sms: ChannelSettings,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            provider: ProviderConfig::default(),
            history: HistoryConfig::default(),
            scheduler: SchedulerConfig::default(),
            dialog: DialogConfig::default(),
            voice: ChannelSettings::voice_defaults(),
            sms: ChannelSettings::sms_defaults(),
        }
    }
}

impl PacerConfig {
    /// Load config from `PACER_CONFIG` or the default path (~/.pacer/config.toml).
    pub fn load() -> Result<Self> {
        let path = std::env::var("PACER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.normalize();
        Ok(config)
    }

    /// Load config from a specific path. Environment overrides are not applied.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| PacerError::Config(format!("Failed to read config: {e}")))?;
        let mut config: Self = toml::from_str(&content)
            .map_err(|e| PacerError::Config(format!("Failed to parse config: {e}")))?;
        config.normalize();
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Pacer home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".pacer")
    }

    /// Overlay secrets and the public callback URL from the environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        if let Some(v) = non_empty("PACER_ACCOUNT_SID") {
            self.provider.account_sid = v;
        }
        if let Some(v) = non_empty("PACER_AUTH_TOKEN") {
            self.provider.auth_token = v;
        }
        if let Some(v) = non_empty("PACER_PUBLIC_BASE_URL") {
            self.gateway.public_base_url = v;
        }
    }

    /// Clamp intervals and caps, and let SMS inherit the voice window when unset.
    pub fn normalize(&mut self) {
        self.voice.normalize(Channel::Voice);
        self.sms.normalize(Channel::Sms);
        if self.sms.active_hours.trim().is_empty() {
            self.sms.active_hours = self.voice.active_hours.clone();
        }
        if self.sms.active_days.is_empty() {
            self.sms.active_days = self.voice.active_days.clone();
        }
        self.scheduler.tick_ms = self.scheduler.tick_ms.max(10);
    }

    pub fn channel(&self, channel: Channel) -> &ChannelSettings {
        match channel {
            Channel::Voice => &self.voice,
            Channel::Sms => &self.sms,
        }
    }

    /// Public base URL with the trailing slash removed, if configured.
    pub fn callback_base(&self) -> Option<&str> {
        let base = self.gateway.public_base_url.trim().trim_end_matches('/');
        if base.is_empty() { None } else { Some(base) }
    }

    /// History database path with `~` expanded.
    pub fn history_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.history.db_path).to_string())
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Externally reachable base URL the provider calls back into.
    #[serde(default)]
    pub public_base_url: String,
}

fn default_port() -> u16 { 5050 }
fn default_host() -> String { "127.0.0.1".into() }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            public_base_url: String::new(),
        }
    }
}

/// Communications provider credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,
    /// Ask the provider to record voice attempts and report recording status.
    #[serde(default)]
    pub record_calls: bool,
}

fn default_api_base() -> String { "https://api.twilio.com/2010-04-01".into() }
fn default_http_timeout() -> u64 { 15 }

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            api_base: default_api_base(),
            http_timeout_secs: default_http_timeout(),
            record_calls: false,
        }
    }
}

impl ProviderConfig {
    pub fn has_credentials(&self) -> bool {
        !self.account_sid.trim().is_empty() && !self.auth_token.trim().is_empty()
    }
}

/// Durable history store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

fn default_db_path() -> String { "~/.pacer/history.db".into() }

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { db_path: default_db_path() }
    }
}

/// Scheduler loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_tick_ms() -> u64 { 200 }
fn default_backoff_ms() -> u64 { 500 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

/// Inputs for the dialog and message composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogConfig {
    #[serde(default)]
    pub company_name: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_personas")]
    pub personas: Vec<String>,
}

fn default_max_turns() -> u32 { 6 }
fn default_personas() -> Vec<String> { vec!["man".into(), "woman".into()] }

impl Default for DialogConfig {
    fn default() -> Self {
        Self {
            company_name: String::new(),
            topic: String::new(),
            max_turns: default_max_turns(),
            personas: default_personas(),
        }
    }
}

/// Policy for one outbound channel.
///
/// Zero intervals and empty window fields mean "use the channel default";
/// `normalize` resolves them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub origin: String,
    /// When non-empty, each attempt picks its origin at random from this pool.
    #[serde(default)]
    pub origin_pool: Vec<String>,
    /// `HH:MM-HH:MM` in local time; wraps past midnight when start > end.
    #[serde(default)]
    pub active_hours: String,
    #[serde(default)]
    pub active_days: Vec<String>,
    #[serde(default)]
    pub min_interval_secs: u64,
    #[serde(default)]
    pub max_interval_secs: u64,
    #[serde(default = "default_hourly_max")]
    pub hourly_max: u32,
    #[serde(default = "default_daily_max")]
    pub daily_max: u32,
    /// SMS body template; `{company_name}` and `{topic}` are substituted.
    #[serde(default)]
    pub template: String,
}

fn default_hourly_max() -> u32 { 3 }
fn default_daily_max() -> u32 { 20 }
fn default_active_hours() -> String { "09:00-18:00".into() }
fn default_active_days() -> Vec<String> {
    ["Mon", "Tue", "Wed", "Thu", "Fri"].iter().map(|d| d.to_string()).collect()
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            enabled: None,
            destination: String::new(),
            origin: String::new(),
            origin_pool: Vec::new(),
            active_hours: String::new(),
            active_days: Vec::new(),
            min_interval_secs: 0,
            max_interval_secs: 0,
            hourly_max: default_hourly_max(),
            daily_max: default_daily_max(),
            template: String::new(),
        }
    }
}

impl ChannelSettings {
    pub fn voice_defaults() -> Self {
        let mut s = Self::default();
        s.normalize(Channel::Voice);
        s
    }

    pub fn sms_defaults() -> Self {
        let mut s = Self::default();
        s.normalize(Channel::Sms);
        s
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }

    /// Fill channel defaults, then apply the interval floor, `max >= min`,
    /// `hourly >= 1` and `daily >= hourly`.
    pub fn normalize(&mut self, channel: Channel) {
        let (default_min, default_max) = match channel {
            Channel::Voice => (120, 420),
            Channel::Sms => (300, 900),
        };
        if self.enabled.is_none() {
            self.enabled = Some(channel == Channel::Voice);
        }
        if self.min_interval_secs == 0 {
            self.min_interval_secs = default_min;
        }
        if self.max_interval_secs == 0 {
            self.max_interval_secs = default_max.max(self.min_interval_secs);
        }
        if channel == Channel::Voice {
            if self.active_hours.trim().is_empty() {
                self.active_hours = default_active_hours();
            }
            if self.active_days.is_empty() {
                self.active_days = default_active_days();
            }
        }
        self.min_interval_secs = self.min_interval_secs.max(channel.min_interval_floor());
        self.max_interval_secs = self.max_interval_secs.max(self.min_interval_secs);
        self.hourly_max = self.hourly_max.max(1);
        self.daily_max = self.daily_max.max(self.hourly_max);
        self.destination = self.destination.trim().to_string();
        self.origin = self.origin.trim().to_string();
        self.origin_pool = self
            .origin_pool
            .iter()
            .map(|o| o.trim().to_string())
            .filter(|o| !o.is_empty())
            .collect();
    }
}
