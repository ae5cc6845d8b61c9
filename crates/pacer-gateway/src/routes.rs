//! API route handlers for the gateway.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Form, Json};
use chrono::Utc;
use pacer_core::{Channel, Moment, ProviderStatus};
use pacer_scheduler::{ChannelScheduler, Participants, StatusEffect, StatusNotification};
use serde::Deserialize;

use crate::server::AppState;

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 200;

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({"ok": false, "error": self.message}));
        (self.status, body).into_response()
    }
}

impl From<pacer_core::PacerError> for ApiError {
    fn from(err: pacer_core::PacerError) -> Self {
        tracing::error!("❌ {err}");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

fn resolve(state: &AppState, raw: &str) -> Result<(Channel, Arc<ChannelScheduler>), ApiError> {
    let channel: Channel = raw
        .parse()
        .map_err(|_| ApiError::not_found(format!("unknown channel '{raw}'")))?;
    Ok((channel, state.scheduler(channel).clone()))
}

/// First non-empty value among `keys`.
fn field<'a>(form: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| form.get(*k))
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
}

fn participants(form: &HashMap<String, String>) -> Participants {
    Participants {
        destination: field(form, &["To"]).map(str::to_string),
        origin: field(form, &["From"]).map(str::to_string),
    }
}

// ---- Health ----

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "pacer",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}

// ---- Operator API ----

pub async fn channel_status(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> ApiResult {
    let (_, scheduler) = resolve(&state, &channel)?;
    let snapshot = scheduler.status(Moment::now());
    Ok(Json(serde_json::to_value(snapshot).map_err(pacer_core::PacerError::from)?))
}

pub async fn channel_live(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> ApiResult {
    let (channel, scheduler) = resolve(&state, &channel)?;
    let attempt = scheduler.lifecycle().live_current();
    Ok(Json(serde_json::json!({
        "channel": channel,
        "in_flight": attempt.is_some(),
        "sid": attempt.as_ref().map(|a| a.sid.clone()),
        "attempt": attempt,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

pub async fn channel_history(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult {
    let (channel, _) = resolve(&state, &channel)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let attempts = state.history.list(channel, limit)?;
    Ok(Json(serde_json::json!({
        "channel": channel,
        "count": attempts.len(),
        "attempts": attempts,
    })))
}

pub async fn attempt_detail(
    State(state): State<Arc<AppState>>,
    Path((channel, sid)): Path<(String, String)>,
) -> ApiResult {
    let (channel, _) = resolve(&state, &channel)?;
    match state.history.load(&sid)? {
        Some(attempt) if attempt.channel == channel => {
            Ok(Json(serde_json::to_value(attempt).map_err(pacer_core::PacerError::from)?))
        }
        _ => Err(ApiError::not_found(format!("attempt '{sid}' not found"))),
    }
}

pub async fn channel_metrics(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> ApiResult {
    let (channel, _) = resolve(&state, &channel)?;
    let metrics = state.history.metrics(channel)?;
    Ok(Json(serde_json::json!({
        "channel": channel,
        "metrics": metrics,
    })))
}

pub async fn attempt_now(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let (channel, scheduler) = resolve(&state, &channel)?;
    if !scheduler.is_enabled() {
        return Err(ApiError::bad_request(format!("{channel} channel is disabled")));
    }
    scheduler.request_immediate_attempt();
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"ok": true, "channel": channel, "queued": true})),
    ))
}

#[derive(Debug, Deserialize)]
pub struct OpeningBody {
    #[serde(default)]
    pub text: String,
}

pub async fn next_opening(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Json(body): Json<OpeningBody>,
) -> ApiResult {
    let (channel, scheduler) = resolve(&state, &channel)?;
    let stored = scheduler
        .set_next_opening(&body.text)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "channel": channel,
        "text": stored,
    })))
}

#[derive(Debug, Deserialize)]
pub struct MessagesBody {
    pub messages: Option<serde_json::Value>,
}

pub async fn list_messages(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({"messages": state.messages.list()}))
}

/// Replace the operator message pool. Non-string and blank entries are skipped.
pub async fn set_messages(
    State(state): State<Arc<AppState>>,
    Json(body): Json<MessagesBody>,
) -> ApiResult {
    let Some(serde_json::Value::Array(items)) = body.messages else {
        return Err(ApiError::bad_request("messages must be a list"));
    };
    let stored = state
        .messages
        .replace(items.iter().filter_map(serde_json::Value::as_str));
    let history = state.history.clone();
    let to_save = stored.clone();
    tokio::task::spawn_blocking(move || history.save_messages(&to_save))
        .await
        .map_err(|e| ApiError::internal(format!("message save task failed: {e}")))??;
    tracing::info!("📝 Operator message pool updated ({} messages)", stored.len());
    Ok(Json(serde_json::json!({"ok": true, "messages": stored})))
}

// ---- Provider hooks ----

pub async fn voice_answer(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> ApiResult {
    let sid = field(&form, &["CallSid"]).ok_or_else(|| ApiError::bad_request("missing CallSid"))?;
    let turn = state
        .voice
        .open_dialog(&state.script, sid, &participants(&form), Utc::now());
    let base = state.config.callback_base().unwrap_or_default();
    Ok(Json(serde_json::json!({
        "sid": sid,
        "lines": turn.lines,
        "persona": turn.persona,
        "hangup": turn.hangup,
        "dialog_url": format!("{base}/hooks/voice/dialog"),
        "partial_url": format!("{base}/hooks/voice/partial"),
    })))
}

pub async fn voice_dialog(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> ApiResult {
    let sid = field(&form, &["CallSid"]).ok_or_else(|| ApiError::bad_request("missing CallSid"))?;
    let heard = field(&form, &["SpeechResult"]).unwrap_or("");
    let turn = state.voice.continue_dialog(
        &state.script,
        state.responder.as_ref(),
        sid,
        heard,
        Utc::now(),
    );
    Ok(Json(serde_json::json!({
        "sid": sid,
        "lines": turn.lines,
        "persona": turn.persona,
        "hangup": turn.hangup,
    })))
}

pub async fn voice_partial(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> ApiResult {
    let sid = field(&form, &["CallSid"]).ok_or_else(|| ApiError::bad_request("missing CallSid"))?;
    let text = field(&form, &["UnstableSpeechResult", "SpeechResult"]).unwrap_or("");
    let recorded = state.voice.on_partial(sid, text, Utc::now());
    Ok(Json(serde_json::json!({"ok": true, "recorded": recorded})))
}

pub async fn voice_status(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> ApiResult {
    status_hook(state.voice.clone(), &form, &["CallSid"], &["CallStatus"]).await
}

pub async fn sms_status(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> ApiResult {
    status_hook(
        state.sms.clone(),
        &form,
        &["MessageSid", "SmsSid"],
        &["MessageStatus", "SmsStatus"],
    )
    .await
}

/// Recording status events. Known recordings are updated; finished attempts
/// are updated in history.
pub async fn voice_recording(
    State(state): State<Arc<AppState>>,
    Form(form): Form<HashMap<String, String>>,
) -> ApiResult {
    let sid = field(&form, &["CallSid"]).ok_or_else(|| ApiError::bad_request("missing CallSid"))?;
    let recording_sid =
        field(&form, &["RecordingSid"]).ok_or_else(|| ApiError::bad_request("missing RecordingSid"))?;
    let status = field(&form, &["RecordingStatus"]).unwrap_or("").to_string();
    let (voice, call, recording) = (state.voice.clone(), sid.to_string(), recording_sid.to_string());
    let status_for_task = status.clone();
    let recorded = tokio::task::spawn_blocking(move || {
        voice.on_recording(&call, &recording, &status_for_task, Utc::now())
    })
    .await
    .map_err(|e| ApiError::internal(format!("recording task failed: {e}")))?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "sid": sid,
        "recording_sid": recording_sid,
        "status": status.to_lowercase(),
        "recorded": recorded,
    })))
}

/// Terminal statuses write history synchronously, so the scheduler call runs
/// on the blocking pool.
async fn status_hook(
    scheduler: Arc<ChannelScheduler>,
    form: &HashMap<String, String>,
    sid_keys: &[&str],
    status_keys: &[&str],
) -> ApiResult {
    let sid = field(form, sid_keys).ok_or_else(|| ApiError::bad_request("missing sid"))?;
    let status = field(form, status_keys).ok_or_else(|| ApiError::bad_request("missing status"))?;
    let notification = StatusNotification {
        sid: sid.to_string(),
        status: ProviderStatus::parse(status),
        duration_secs: field(form, &["CallDuration", "Duration"]).and_then(|d| d.parse().ok()),
        participants: participants(form),
    };
    let task_notification = notification.clone();
    let effect = tokio::task::spawn_blocking(move || {
        scheduler.on_status(&task_notification, Utc::now())
    })
    .await
    .map_err(|e| ApiError::internal(format!("status task failed: {e}")))?;
    let applied = match effect {
        StatusEffect::Tracked(_) => "tracked",
        StatusEffect::Finished(_) => "finished",
        StatusEffect::Ignored => "ignored",
    };
    Ok(Json(serde_json::json!({
        "ok": true,
        "sid": sid,
        "status": notification.status.as_str(),
        "applied": applied,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::build_router_from_arc;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use pacer_core::traits::Placement;
    use pacer_core::{PacerConfig, PlacementRequest};
    use pacer_scheduler::HistoryDb;
    use tower::ServiceExt;

    struct OkPlacement;

    #[async_trait]
    impl Placement for OkPlacement {
        fn name(&self) -> &str {
            "ok"
        }

        async fn place(&self, _request: &PlacementRequest) -> pacer_core::Result<String> {
            Ok("CA0000000001".into())
        }
    }

    fn test_config() -> PacerConfig {
        let mut config = PacerConfig::default();
        config.gateway.public_base_url = "https://hooks.example.com".into();
        config.voice.destination = "+15550100".into();
        config.voice.origin = "+15550001".into();
        config.normalize();
        config
    }

    fn test_state() -> Arc<AppState> {
        let history = Arc::new(HistoryDb::open_in_memory().unwrap());
        Arc::new(AppState::new(test_config(), Arc::new(OkPlacement), history))
    }

    async fn send(state: Arc<AppState>, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let resp = build_router_from_arc(state).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_form(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let (status, json) = send(test_state(), get("/health")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "pacer");
    }

    #[tokio::test]
    async fn test_channel_status() {
        let (status, json) = send(test_state(), get("/api/v1/voice/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["channel"], "voice");
        assert_eq!(json["in_flight"], false);
        assert_eq!(json["hourly_max"], 3);
        assert_eq!(json["destination"], "...0100");
        assert!(json["reasons"].is_array());
    }

    #[tokio::test]
    async fn test_unknown_channel_is_404() {
        let (status, json) = send(test_state(), get("/api/v1/fax/status")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["ok"], false);
    }

    #[tokio::test]
    async fn test_attempt_now() {
        let state = test_state();
        let (status, json) = send(state.clone(), post_json("/api/v1/voice/attempt-now", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(json["queued"], true);

        let (_, json) = send(state, get("/api/v1/voice/status")).await;
        assert_eq!(json["manual_pending"], true);
    }

    #[tokio::test]
    async fn test_attempt_now_rejected_when_disabled() {
        let (status, _) = send(test_state(), post_json("/api/v1/sms/attempt-now", serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_next_opening_validation() {
        let state = test_state();
        let (status, _) = send(
            state.clone(),
            post_json("/api/v1/voice/next-opening", serde_json::json!({"text": "  "})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            state.clone(),
            post_json("/api/v1/voice/next-opening", serde_json::json!({"text": "x".repeat(151)})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, json) = send(
            state.clone(),
            post_json("/api/v1/voice/next-opening", serde_json::json!({"text": "Hello there"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["text"], "Hello there");
        assert_eq!(state.voice.opening().peek().as_deref(), Some("Hello there"));
    }

    #[tokio::test]
    async fn test_status_hook_for_unknown_sid_persists() {
        let state = test_state();
        let (status, json) = send(
            state.clone(),
            post_form(
                "/hooks/voice/status",
                "CallSid=CAunknown0001&CallStatus=completed&CallDuration=12&To=%2B15550100",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["applied"], "finished");

        let (status, json) = send(state.clone(), get("/api/v1/voice/history/CAunknown0001")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["state"], "completed");
        assert_eq!(json["duration_secs"], 12);
        assert_eq!(json["destination"], "+15550100");

        let (_, json) = send(state, get("/api/v1/voice/metrics")).await;
        assert_eq!(json["metrics"]["total"], 1);
    }

    #[tokio::test]
    async fn test_status_hook_requires_sid() {
        let (status, _) = send(test_state(), post_form("/hooks/sms/status", "MessageStatus=sent")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_history_detail_missing_is_404() {
        let (status, _) = send(test_state(), get("/api/v1/voice/history/CAnope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_voice_call_flow() {
        let state = test_state();
        let (status, json) = send(
            state.clone(),
            post_form("/hooks/voice/answer", "CallSid=CA0000000001&To=%2B15550100&From=%2B15550001"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(!json["lines"][0].as_str().unwrap().is_empty());
        assert_eq!(json["dialog_url"], "https://hooks.example.com/hooks/voice/dialog");

        let (_, json) = send(state.clone(), get("/api/v1/voice/live")).await;
        assert_eq!(json["sid"], "CA0000000001");

        let (_, json) = send(
            state.clone(),
            post_form("/hooks/voice/partial", "CallSid=CA0000000001&UnstableSpeechResult=hel"),
        )
        .await;
        assert_eq!(json["recorded"], true);

        let (_, json) = send(
            state.clone(),
            post_form("/hooks/voice/dialog", "CallSid=CA0000000001&SpeechResult=hello"),
        )
        .await;
        assert_eq!(json["hangup"], false);

        send(
            state.clone(),
            post_form("/hooks/voice/status", "CallSid=CA0000000001&CallStatus=completed"),
        )
        .await;
        let (_, json) = send(state, get("/api/v1/voice/history?limit=5")).await;
        assert_eq!(json["count"], 1);
        assert_eq!(json["attempts"][0]["event_count"], 4);
    }

    #[tokio::test]
    async fn test_status_hooks_complete_concurrently() {
        let state = test_state();
        let voice = post_form(
            "/hooks/voice/status",
            "CallSid=CAconcurrent01&CallStatus=busy&To=%2B15550100",
        );
        let sms = post_form(
            "/hooks/sms/status",
            "MessageSid=SMconcurrent01&MessageStatus=delivered&To=%2B15550100",
        );
        let ((vs, vj), (ss, sj)) = tokio::join!(send(state.clone(), voice), send(state.clone(), sms));
        assert_eq!((vs, ss), (StatusCode::OK, StatusCode::OK));
        assert_eq!(vj["applied"], "finished");
        assert_eq!(sj["applied"], "finished");

        assert_eq!(state.history.load("CAconcurrent01").unwrap().unwrap().state.as_str(), "failed");
        assert_eq!(state.history.load("SMconcurrent01").unwrap().unwrap().state.as_str(), "completed");
    }

    #[tokio::test]
    async fn test_message_pool_roundtrip() {
        let state = test_state();
        let (status, json) = send(state.clone(), get("/api/v1/messages")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["messages"], serde_json::json!([]));

        let mut items: Vec<serde_json::Value> = vec![
            serde_json::json!("  Hello from the pool  "),
            serde_json::json!(42),
            serde_json::json!("   "),
        ];
        items.extend((0..12).map(|i| serde_json::json!(format!("extra {i}"))));
        let (status, json) = send(
            state.clone(),
            post_json("/api/v1/messages", serde_json::json!({"messages": items})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["messages"].as_array().unwrap().len(), 10);
        assert_eq!(json["messages"][0], "Hello from the pool");

        let (_, json) = send(state.clone(), get("/api/v1/messages")).await;
        assert_eq!(json["messages"][1], "extra 0");

        // stored in history and reloaded by a fresh state
        let reloaded = AppState::new(test_config(), Arc::new(OkPlacement), state.history.clone());
        assert_eq!(reloaded.messages.list().len(), 10);
        assert_eq!(reloaded.voice.messages().list()[0], "Hello from the pool");
    }

    #[tokio::test]
    async fn test_message_pool_rejects_non_list() {
        let (status, json) = send(
            test_state(),
            post_json("/api/v1/messages", serde_json::json!({"messages": "nope"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["ok"], false);
    }

    #[tokio::test]
    async fn test_recording_hook() {
        let state = test_state();
        send(
            state.clone(),
            post_form("/hooks/voice/answer", "CallSid=CA0000000001&To=%2B15550100&From=%2B15550001"),
        )
        .await;

        let (status, json) = send(
            state.clone(),
            post_form(
                "/hooks/voice/recording",
                "CallSid=CA0000000001&RecordingSid=RE0000000001&RecordingStatus=in-progress",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["recorded"], true);

        send(
            state.clone(),
            post_form("/hooks/voice/status", "CallSid=CA0000000001&CallStatus=completed"),
        )
        .await;
        let (_, json) = send(
            state.clone(),
            post_form(
                "/hooks/voice/recording",
                "CallSid=CA0000000001&RecordingSid=RE0000000001&RecordingStatus=completed",
            ),
        )
        .await;
        assert_eq!(json["recorded"], true);

        let (_, json) = send(state.clone(), get("/api/v1/voice/history/CA0000000001")).await;
        assert_eq!(json["recordings"][0]["recording_sid"], "RE0000000001");
        assert_eq!(json["recordings"][0]["status"], "completed");

        let (status, _) = send(
            state,
            post_form("/hooks/voice/recording", "CallSid=CA0000000001&RecordingStatus=completed"),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
