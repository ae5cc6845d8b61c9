//! HTTP server implementation using Axum.

use std::sync::Arc;

use axum::{
    Router,
    routing::{get, post},
};
use pacer_core::traits::{HistorySink, Placement, Responder};
use pacer_core::{Channel, PacerConfig};
use pacer_scheduler::{
    ChannelScheduler, DialogScript, FollowUpResponder, HistoryDb, MessagePool, spawn_scheduler,
};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared state for the gateway server.
pub struct AppState {
    pub config: PacerConfig,
    pub voice: Arc<ChannelScheduler>,
    pub sms: Arc<ChannelScheduler>,
    /// Durable history, also the lifecycle stores' sink.
    pub history: Arc<HistoryDb>,
    /// Operator messages shared by both channels.
    pub messages: Arc<MessagePool>,
    pub script: DialogScript,
    pub responder: Arc<dyn Responder>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: PacerConfig, placement: Arc<dyn Placement>, history: Arc<HistoryDb>) -> Self {
        let sink: Arc<dyn HistorySink> = history.clone();
        let stored = history.load_messages().unwrap_or_else(|e| {
            tracing::error!("❌ Failed to load operator messages: {e}");
            Vec::new()
        });
        let messages = Arc::new(MessagePool::new(stored));
        let voice = Arc::new(
            ChannelScheduler::new(Channel::Voice, &config, placement.clone(), sink.clone())
                .with_messages(messages.clone()),
        );
        let sms = Arc::new(
            ChannelScheduler::new(Channel::Sms, &config, placement, sink)
                .with_messages(messages.clone()),
        );
        Self {
            script: DialogScript::new(&config.dialog),
            config,
            voice,
            sms,
            history,
            messages,
            responder: Arc::new(FollowUpResponder),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn scheduler(&self, channel: Channel) -> &Arc<ChannelScheduler> {
        match channel {
            Channel::Voice => &self.voice,
            Channel::Sms => &self.sms,
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/v1/{channel}/status", get(super::routes::channel_status))
        .route("/api/v1/{channel}/live", get(super::routes::channel_live))
        .route("/api/v1/{channel}/history", get(super::routes::channel_history))
        .route("/api/v1/{channel}/history/{sid}", get(super::routes::attempt_detail))
        .route("/api/v1/{channel}/metrics", get(super::routes::channel_metrics))
        .route("/api/v1/{channel}/attempt-now", post(super::routes::attempt_now))
        .route("/api/v1/{channel}/next-opening", post(super::routes::next_opening))
        .route(
            "/api/v1/messages",
            get(super::routes::list_messages).post(super::routes::set_messages),
        );

    // Provider callbacks, form-encoded
    let hooks = Router::new()
        .route("/hooks/voice/answer", post(super::routes::voice_answer))
        .route("/hooks/voice/dialog", post(super::routes::voice_dialog))
        .route("/hooks/voice/partial", post(super::routes::voice_partial))
        .route("/hooks/voice/status", post(super::routes::voice_status))
        .route("/hooks/voice/recording", post(super::routes::voice_recording))
        .route("/hooks/sms/status", post(super::routes::sms_status));

    Router::new()
        .route("/health", get(super::routes::health_check))
        .merge(api)
        .merge(hooks)
        .layer(
            CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .allow_origin(Any)
                .max_age(std::time::Duration::from_secs(3600)),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Open history, build both channel schedulers, and serve until Ctrl-C.
pub async fn start(config: PacerConfig) -> anyhow::Result<()> {
    let db_path = config.history_path();
    let history = match HistoryDb::open(&db_path) {
        Ok(db) => {
            tracing::info!("💾 History DB initialized: {}", db_path.display());
            db
        }
        Err(e) => {
            tracing::error!("❌ Failed to open history DB: {e}; using in-memory store");
            HistoryDb::open_in_memory()?
        }
    };
    let placement = pacer_providers::create_placement(&config)?;
    let state = Arc::new(AppState::new(config, placement, Arc::new(history)));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = Vec::new();
    for channel in Channel::ALL {
        let scheduler = state.scheduler(channel);
        let diag = scheduler.diagnostics();
        for warning in &diag.warnings {
            tracing::warn!("⚠️ [{channel}] {warning}");
        }
        if !scheduler.is_enabled() {
            tracing::info!("{} [{channel}] disabled", channel.icon());
            continue;
        }
        if !diag.ready {
            tracing::warn!("⚠️ [{channel}] not ready: {}", diag.reasons.join(", "));
        }
        loops.push(spawn_scheduler(scheduler.clone(), shutdown_rx.clone()));
    }

    let app = build_router_from_arc(state.clone());
    let addr = format!("{}:{}", state.config.gateway.host, state.config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("🛑 Shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for handle in loops {
        let _ = handle.await;
    }
    Ok(())
}
