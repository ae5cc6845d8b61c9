//! REST placement client.
//!
//! Calls and messages are created with a form-encoded POST under
//! `{api_base}/Accounts/{account_sid}/`, authenticated with HTTP basic auth.
//! The response body is JSON carrying the new resource's `sid`.

use std::time::Duration;

use async_trait::async_trait;
use pacer_core::config::ProviderConfig;
use pacer_core::error::{PacerError, Result};
use pacer_core::mask::mask_phone;
use pacer_core::traits::Placement;
use pacer_core::types::{Channel, PlacementRequest};

/// Status events the provider should report for voice attempts.
const VOICE_STATUS_EVENTS: [&str; 4] = ["initiated", "ringing", "answered", "completed"];
const RECORDING_EVENTS: [&str; 2] = ["in-progress", "completed"];

/// Placement over the provider's REST API.
pub struct RestPlacement {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl RestPlacement {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs.max(1)))
            .build()
            .map_err(|e| PacerError::Provider(format!("HTTP client: {e}")))?;
        Ok(Self {
            config: config.clone(),
            client,
        })
    }

    fn endpoint(&self, channel: Channel) -> String {
        let resource = match channel {
            Channel::Voice => "Calls.json",
            Channel::Sms => "Messages.json",
        };
        format!(
            "{}/Accounts/{}/{resource}",
            self.config.api_base.trim_end_matches('/'),
            self.config.account_sid
        )
    }
}

/// Form fields for a placement request. `record` only applies to voice.
pub fn form_params(request: &PlacementRequest, record: bool) -> Result<Vec<(&'static str, String)>> {
    let mut form = vec![
        ("To", request.destination.clone()),
        ("From", request.origin.clone()),
    ];
    match request.channel {
        Channel::Voice => {
            let entry = request.callbacks.entry.clone().ok_or_else(|| {
                PacerError::InvalidInput("voice placement needs an answer URL".into())
            })?;
            form.push(("Url", entry));
            form.push(("Method", "POST".into()));
            form.push(("StatusCallback", request.callbacks.status.clone()));
            form.push(("StatusCallbackMethod", "POST".into()));
            for event in VOICE_STATUS_EVENTS {
                form.push(("StatusCallbackEvent", event.into()));
            }
            if let Some(url) = request.callbacks.recording.clone().filter(|_| record) {
                form.push(("Record", "true".into()));
                form.push(("RecordingStatusCallback", url));
                form.push(("RecordingStatusCallbackMethod", "POST".into()));
                for event in RECORDING_EVENTS {
                    form.push(("RecordingStatusCallbackEvent", event.into()));
                }
            }
        }
        Channel::Sms => {
            let body = request
                .body
                .clone()
                .filter(|b| !b.trim().is_empty())
                .ok_or_else(|| PacerError::InvalidInput("message body is empty".into()))?;
            form.push(("Body", body));
            form.push(("StatusCallback", request.callbacks.status.clone()));
        }
    }
    Ok(form)
}

/// Extract the resource sid from a creation response.
pub fn parse_sid(body: &serde_json::Value) -> Result<String> {
    body["sid"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| PacerError::Provider("response has no sid".into()))
}

#[async_trait]
impl Placement for RestPlacement {
    fn name(&self) -> &str {
        "rest"
    }

    fn is_configured(&self) -> bool {
        self.config.has_credentials()
    }

    async fn place(&self, request: &PlacementRequest) -> Result<String> {
        if !self.is_configured() {
            return Err(PacerError::Provider("credentials not configured".into()));
        }
        let form = form_params(request, self.config.record_calls)?;
        tracing::debug!(
            "[{}] POST {} → {}",
            request.channel,
            self.endpoint(request.channel),
            mask_phone(&request.destination)
        );

        let response = self
            .client
            .post(self.endpoint(request.channel))
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await
            .map_err(|e| PacerError::Provider(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            return Err(PacerError::Provider(format!("HTTP {status}: {detail}")));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| PacerError::Provider(format!("invalid response: {e}")))?;
        parse_sid(&body)
    }
}
