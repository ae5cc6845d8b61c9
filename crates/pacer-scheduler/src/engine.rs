//! Channel scheduler: the control loop that turns deadlines and manual
//! requests into admitted placements, and folds provider callbacks back
//! into lifecycle state.
//!
//! One `ChannelScheduler` is built per channel. The loop ticks on a short
//! fixed period and is woken early by manual triggers.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use pacer_core::config::PacerConfig;
use pacer_core::mask::{mask_phone, mask_sid};
use pacer_core::{
    AssignedParams, CallbackUrls, Channel, HistorySink, LastError, Moment, Placement,
    PlacementRequest, ProviderStatus, Responder, Role,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dialog::{DialogScript, DialogTurn};
use crate::gate::{AttemptGate, Decision, Diagnostics};
use crate::interval::IntervalScheduler;
use crate::ledger::AttemptLedger;
use crate::lifecycle::{BeginOutcome, CompleteOutcome, LifecycleStore, Participants, Slot};
use crate::messages::MessagePool;
use crate::params::ParamSelector;
use crate::trigger::{ManualTrigger, OpeningMailbox};
use crate::window::ActiveWindowPolicy;

/// What started an admission cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Cause {
    Manual,
    Timer,
}

/// Result of one admission + placement cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Placed { sid: String, cause: Cause },
    Denied { decision: Decision, cause: Cause },
    Failed { message: String, cause: Cause },
}

/// Most recent denial, for the status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DenialRecord {
    pub at: DateTime<Utc>,
    pub cause: Cause,
    pub reasons: Vec<&'static str>,
    pub retry_after_secs: Option<u64>,
}

/// Inbound provider status callback.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusNotification {
    pub sid: String,
    pub status: ProviderStatus,
    pub duration_secs: Option<u64>,
    pub participants: Participants,
}

/// How a status callback was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusEffect {
    Tracked(BeginOutcome),
    Finished(CompleteOutcome),
    Ignored,
}

/// Operator-facing view of one channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub channel: Channel,
    pub enabled: bool,
    pub in_flight: bool,
    pub pending: bool,
    pub sid: Option<String>,
    pub destination: String,
    pub seconds_until_next: Option<u64>,
    pub interval_total: Option<u64>,
    pub attempts_last_hour: u32,
    pub attempts_last_day: u32,
    pub hourly_max: u32,
    pub daily_max: u32,
    pub can_attempt_now: bool,
    pub retry_after_secs: Option<u64>,
    pub window_open: bool,
    pub active_hours: String,
    pub ready: bool,
    pub reasons: Vec<&'static str>,
    pub warnings: Vec<&'static str>,
    pub manual_pending: bool,
    pub opening_queued: bool,
    pub last_error: Option<LastError>,
    pub last_denial: Option<DenialRecord>,
}

/// Scheduler, gate, and stores for one channel.
pub struct ChannelScheduler {
    channel: Channel,
    enabled: bool,
    destination: String,
    ledger: Arc<AttemptLedger>,
    schedule: IntervalScheduler,
    gate: AttemptGate,
    lifecycle: Arc<LifecycleStore>,
    trigger: ManualTrigger,
    opening: OpeningMailbox,
    messages: Arc<MessagePool>,
    params: ParamSelector,
    placement: Arc<dyn Placement>,
    last_error: Mutex<Option<LastError>>,
    last_denial: Mutex<Option<DenialRecord>>,
    tick: Duration,
    backoff: Duration,
}

impl ChannelScheduler {
    /// Build a scheduler for `channel` from normalized configuration.
    pub fn new(
        channel: Channel,
        config: &PacerConfig,
        placement: Arc<dyn Placement>,
        sink: Arc<dyn HistorySink>,
    ) -> Self {
        let settings = config.channel(channel);
        let ledger = Arc::new(AttemptLedger::new(settings.hourly_max, settings.daily_max));
        let lifecycle = Arc::new(LifecycleStore::new(channel, sink));
        let window = ActiveWindowPolicy::new(&settings.active_hours, &settings.active_days);
        let gate = AttemptGate::new(
            channel,
            settings.is_enabled(),
            &settings.destination,
            config.callback_base(),
            window,
            ledger.clone(),
            lifecycle.clone(),
            placement.clone(),
        );
        Self {
            channel,
            enabled: settings.is_enabled(),
            destination: settings.destination.clone(),
            ledger,
            schedule: IntervalScheduler::new(settings.min_interval_secs, settings.max_interval_secs),
            gate,
            lifecycle,
            trigger: ManualTrigger::new(),
            opening: OpeningMailbox::new(channel),
            messages: Arc::new(MessagePool::default()),
            params: ParamSelector::new(
                channel,
                settings,
                &config.dialog,
                DialogScript::variant_count(),
            ),
            placement,
            last_error: Mutex::new(None),
            last_denial: Mutex::new(None),
            tick: Duration::from_millis(config.scheduler.tick_ms),
            backoff: Duration::from_millis(config.scheduler.backoff_ms),
        }
    }

    /// Share an operator message pool with this scheduler.
    pub fn with_messages(mut self, messages: Arc<MessagePool>) -> Self {
        self.messages = messages;
        self
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn lifecycle(&self) -> &LifecycleStore {
        &self.lifecycle
    }

    pub fn ledger(&self) -> &AttemptLedger {
        &self.ledger
    }

    pub fn schedule(&self) -> &IntervalScheduler {
        &self.schedule
    }

    pub fn gate(&self) -> &AttemptGate {
        &self.gate
    }

    pub fn opening(&self) -> &OpeningMailbox {
        &self.opening
    }

    pub fn messages(&self) -> &MessagePool {
        &self.messages
    }

    /// Ask the loop for an immediate eligibility check. Returns at once.
    pub fn request_immediate_attempt(&self) {
        tracing::info!("{} [{}] Manual attempt requested", self.channel.icon(), self.channel);
        self.trigger.request();
    }

    /// Queue opening text for the next placement. Last write wins.
    pub fn set_next_opening(&self, text: &str) -> pacer_core::Result<String> {
        let stored = self.opening.set(text)?;
        tracing::info!(
            "📝 [{}] Next opening queued ({} chars)",
            self.channel,
            stored.chars().count()
        );
        Ok(stored)
    }

    pub fn last_error(&self) -> Option<LastError> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_last_error(&self, err: Option<LastError>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = err;
    }

    fn record_denial(&self, decision: &Decision, cause: Cause, now: Moment) {
        *self.last_denial.lock().unwrap_or_else(PoisonError::into_inner) = Some(DenialRecord {
            at: now.utc,
            cause,
            reasons: decision.codes(),
            retry_after_secs: decision.retry_after_secs(),
        });
    }

    /// One loop iteration at `now`.
    pub async fn tick_at(&self, now: Moment) -> Vec<CycleOutcome> {
        if self.schedule.initialize_if_needed(now.epoch()) {
            tracing::debug!(
                "[{}] schedule initialized: {:?}",
                self.channel,
                self.schedule.snapshot(now.epoch())
            );
        }
        self.lifecycle.expire_stale_pending(now.utc);
        let mut outcomes = Vec::new();
        if self.trigger.take() {
            outcomes.push(self.run_cycle(now, Cause::Manual).await);
        }
        if self.schedule.is_due(now.epoch()) {
            outcomes.push(self.run_cycle(now, Cause::Timer).await);
        }
        outcomes
    }

    async fn run_cycle(&self, now: Moment, cause: Cause) -> CycleOutcome {
        let origin = self.params.choose_origin();
        let decision = self.gate.admit(&self.destination, origin.as_deref(), now);
        let origin = match origin {
            Some(o) if decision.allow => o,
            _ => return self.deny(decision, cause, now),
        };
        if !self.lifecycle.mark_pending(now.utc) {
            let decision = self.gate.admit(&self.destination, Some(&origin), now);
            return self.deny(decision, cause, now);
        }

        let opening = self.opening.take();
        let params = self
            .params
            .assign(origin.clone(), opening.clone(), self.messages.pick());
        let callbacks = CallbackUrls::for_channel(self.gate.callback_base().unwrap_or_default(), self.channel);
        let request = PlacementRequest {
            channel: self.channel,
            destination: self.destination.clone(),
            origin: origin.clone(),
            callbacks,
            body: params.body.clone(),
        };

        match self.placement.place(&request).await {
            Ok(sid) => {
                self.on_placed(&sid, &origin, params, now);
                CycleOutcome::Placed { sid, cause }
            }
            Err(e) => {
                self.lifecycle.clear_pending();
                if let Some(text) = opening {
                    self.opening.restore(text);
                }
                let message = e.to_string();
                self.set_last_error(Some(LastError {
                    at: now.utc,
                    message: message.clone(),
                }));
                let next = self.schedule.arm(now.epoch());
                tracing::warn!(
                    "⚠️ [{}] Placement via {} failed: {message} (retry in {next}s)",
                    self.channel,
                    self.placement.name()
                );
                CycleOutcome::Failed { message, cause }
            }
        }
    }

    fn deny(&self, decision: Decision, cause: Cause, now: Moment) -> CycleOutcome {
        self.record_denial(&decision, cause, now);
        let next = self.schedule.arm(now.epoch());
        tracing::debug!(
            "[{}] {:?} cycle denied ({}); next check in {next}s",
            self.channel,
            cause,
            decision.codes().join(", ")
        );
        CycleOutcome::Denied { decision, cause }
    }

    fn on_placed(&self, sid: &str, origin: &str, params: AssignedParams, now: Moment) {
        let body = params.body.clone();
        let tracked = self
            .lifecycle
            .begin(sid, &self.destination, origin, Some(params), now.utc);
        self.ledger.record(&self.destination, now.epoch());
        self.set_last_error(None);

        if tracked == BeginOutcome::AlreadyCompleted {
            // Terminal callback arrived before the placement response.
            self.lifecycle.clear_pending();
            if self.schedule.state().next_deadline.is_none() {
                self.schedule.arm(now.epoch());
            }
            tracing::info!(
                "{} [{}] {} finished before placement returned",
                self.channel.icon(),
                self.channel,
                mask_sid(sid)
            );
            return;
        }

        if let Some(body) = body {
            self.lifecycle
                .append_event(sid, Role::Assistant, &body, true, now.utc);
        }
        self.schedule.disarm();
        tracing::info!(
            "{} [{}] Placed {} → {} via {}",
            self.channel.icon(),
            self.channel,
            mask_sid(sid),
            mask_phone(&self.destination),
            self.placement.name()
        );
    }

    /// Apply a provider status callback. Terminal statuses re-arm the schedule.
    pub fn on_status(&self, n: &StatusNotification, now: DateTime<Utc>) -> StatusEffect {
        if n.sid.trim().is_empty() {
            return StatusEffect::Ignored;
        }
        self.lifecycle.note_status(&n.sid, n.status.as_str());
        if self.channel == Channel::Sms {
            self.lifecycle.append_event(
                &n.sid,
                Role::Provider,
                &format!("status: {}", n.status.as_str()),
                true,
                now,
            );
        }
        match n.status.outcome() {
            None => {
                let outcome = self.lifecycle.begin(
                    &n.sid,
                    n.participants.destination.as_deref().unwrap_or(""),
                    n.participants.origin.as_deref().unwrap_or(""),
                    None,
                    now,
                );
                StatusEffect::Tracked(outcome)
            }
            Some(outcome) => {
                let result = self.lifecycle.complete(
                    &n.sid,
                    outcome,
                    now,
                    n.duration_secs,
                    &n.participants,
                );
                if result != CompleteOutcome::Duplicate {
                    let next = self.schedule.arm(now.timestamp());
                    tracing::info!(
                        "⏰ [{}] {} finished ({}); next attempt in {next}s",
                        self.channel,
                        mask_sid(&n.sid),
                        n.status.as_str()
                    );
                }
                StatusEffect::Finished(result)
            }
        }
    }

    /// Recording status for an attempt, live or already finished.
    pub fn on_recording(
        &self,
        sid: &str,
        recording_sid: &str,
        status: &str,
        now: DateTime<Utc>,
    ) -> bool {
        if sid.trim().is_empty() || recording_sid.trim().is_empty() {
            return false;
        }
        self.lifecycle.note_recording(sid, recording_sid, status, now)
    }

    /// Partial speech for a live attempt.
    pub fn on_partial(&self, sid: &str, text: &str, now: DateTime<Utc>) -> bool {
        self.lifecycle.append_event(sid, Role::Callee, text, false, now)
    }

    /// Parameters for the dialog of `sid`, tracking it if unseen.
    pub fn answer(&self, sid: &str, participants: &Participants, now: DateTime<Utc>) -> AssignedParams {
        self.lifecycle.begin(
            sid,
            participants.destination.as_deref().unwrap_or(""),
            participants.origin.as_deref().unwrap_or(""),
            None,
            now,
        );
        self.lifecycle.params_for(sid).unwrap_or_else(|| AssignedParams {
            persona: self.params.default_persona(),
            variant: Some(0),
            origin: participants.origin.clone().unwrap_or_default(),
            ..Default::default()
        })
    }

    /// Opening turn for an answered voice attempt. The spoken lines are logged
    /// on the attempt.
    pub fn open_dialog(
        &self,
        script: &DialogScript,
        sid: &str,
        participants: &Participants,
        now: DateTime<Utc>,
    ) -> DialogTurn {
        let params = self.answer(sid, participants, now);
        let turn = script.opening(&params);
        for line in &turn.lines {
            self.lifecycle.append_event(sid, Role::Assistant, line, true, now);
        }
        turn
    }

    /// Record what the callee said and produce the next turn.
    pub fn continue_dialog(
        &self,
        script: &DialogScript,
        responder: &dyn Responder,
        sid: &str,
        heard: &str,
        now: DateTime<Utc>,
    ) -> DialogTurn {
        self.lifecycle.append_event(sid, Role::Callee, heard, true, now);
        let (params, turn) = match self.lifecycle.live(sid) {
            Some(a) => {
                let heard_turns = a
                    .events
                    .iter()
                    .filter(|e| e.role == Role::Callee && e.is_final)
                    .count();
                (a.params.unwrap_or_default(), heard_turns.max(1) as u32)
            }
            None => (AssignedParams::default(), 1),
        };
        let reply = script.reply(&params, turn, heard, responder);
        for line in &reply.lines {
            self.lifecycle.append_event(sid, Role::Assistant, line, true, now);
        }
        reply
    }

    /// Static readiness for the configured origin.
    pub fn diagnostics(&self) -> Diagnostics {
        self.gate.diagnostics(self.params.any_origin().as_deref())
    }

    /// Point-in-time status, computed without mutating any store.
    pub fn status(&self, now: Moment) -> StatusSnapshot {
        let slot = self.lifecycle.slot();
        let origin = self.params.any_origin();
        let preview = self.gate.preview(&self.destination, origin.as_deref(), now);
        let diag = self.diagnostics();
        let counts = self.ledger.peek(&self.destination, now.epoch());
        let schedule = self.schedule.snapshot(now.epoch());
        StatusSnapshot {
            channel: self.channel,
            enabled: self.enabled,
            in_flight: matches!(slot, Slot::InFlight { .. }),
            pending: matches!(slot, Slot::Pending { .. }),
            sid: match slot {
                Slot::InFlight { sid } => Some(sid),
                _ => None,
            },
            destination: mask_phone(&self.destination),
            seconds_until_next: schedule.seconds_until_next,
            interval_total: schedule.interval_total,
            attempts_last_hour: counts.last_hour,
            attempts_last_day: counts.last_day,
            hourly_max: self.ledger.hourly_max(),
            daily_max: self.ledger.daily_max(),
            can_attempt_now: preview.allow,
            retry_after_secs: preview.retry_after_secs(),
            window_open: self.gate.window().is_open(now.local),
            active_hours: self.gate.window().span(),
            ready: diag.ready,
            reasons: diag.reasons,
            warnings: diag.warnings,
            manual_pending: self.trigger.is_pending(),
            opening_queued: self.opening.peek().is_some(),
            last_error: self.last_error(),
            last_denial: self
                .last_denial
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        }
    }

    /// Run the loop until `shutdown` flips to true or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "⏰ [{}] Scheduler started (tick {}ms, interval {:?}s)",
            self.channel,
            self.tick.as_millis(),
            self.schedule.bounds()
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match AssertUnwindSafe(self.tick_at(Moment::now()))
                .catch_unwind()
                .await
            {
                Ok(_) => self.tick,
                Err(_) => {
                    tracing::error!("❌ [{}] Scheduler tick panicked; backing off", self.channel);
                    self.backoff
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                _ = self.trigger.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!("🛑 [{}] Scheduler stopped", self.channel);
    }
}

/// Spawn the scheduler loop as a background tokio task.
pub fn spawn_scheduler(
    scheduler: Arc<ChannelScheduler>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(scheduler.run(shutdown))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::RecordingSink;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use pacer_core::{AttemptState, PacerError, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};

    const DEST: &str = "+15550100";

    /// Placement double: fails while `fail` is set, otherwise returns sequential sids.
    struct FakePlacement {
        fail: std::sync::atomic::AtomicBool,
        calls: AtomicUsize,
        requests: Mutex<Vec<PlacementRequest>>,
    }

    impl FakePlacement {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                fail: std::sync::atomic::AtomicBool::new(fail),
                calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Placement for FakePlacement {
        fn name(&self) -> &str {
            "fake"
        }

        async fn place(&self, request: &PlacementRequest) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            if self.fail.load(Ordering::SeqCst) {
                return Err(PacerError::Provider("HTTP 503".into()));
            }
            Ok(format!("CA{n:04}abcdef"))
        }
    }

    /// Placement double that delivers provider callbacks before `place`
    /// returns. A `None` sid in `early` targets the attempt being placed.
    struct CallbackFirstPlacement {
        scheduler: OnceLock<Weak<ChannelScheduler>>,
        calls: AtomicUsize,
        early: Vec<(Option<&'static str>, ProviderStatus)>,
        slots_seen: Mutex<Vec<Slot>>,
    }

    #[async_trait]
    impl Placement for CallbackFirstPlacement {
        fn name(&self) -> &str {
            "callback-first"
        }

        async fn place(&self, _request: &PlacementRequest) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let sid = format!("CArace{n:04}");
            if let Some(s) = self.scheduler.get().and_then(Weak::upgrade) {
                self.slots_seen.lock().unwrap().push(s.lifecycle().slot());
                for (target, status) in &self.early {
                    let note = StatusNotification {
                        sid: target.map(str::to_string).unwrap_or_else(|| sid.clone()),
                        status: status.clone(),
                        duration_secs: None,
                        participants: Participants::default(),
                    };
                    s.on_status(&note, now().utc);
                }
            }
            Ok(sid)
        }
    }

    fn interleaved(
        early: Vec<(Option<&'static str>, ProviderStatus)>,
    ) -> (Arc<ChannelScheduler>, Arc<CallbackFirstPlacement>, Arc<RecordingSink>) {
        let placement = Arc::new(CallbackFirstPlacement {
            scheduler: OnceLock::new(),
            calls: AtomicUsize::new(0),
            early,
            slots_seen: Mutex::new(Vec::new()),
        });
        let sink = Arc::new(RecordingSink::default());
        let s = Arc::new(ChannelScheduler::new(
            Channel::Voice,
            &config(),
            placement.clone(),
            sink.clone(),
        ));
        let _ = placement.scheduler.set(Arc::downgrade(&s));
        (s, placement, sink)
    }

    fn config() -> PacerConfig {
        let mut cfg = PacerConfig::default();
        cfg.gateway.public_base_url = "https://hooks.example.com".into();
        for s in [&mut cfg.voice, &mut cfg.sms] {
            s.enabled = Some(true);
            s.destination = DEST.into();
            s.origin = "+15550001".into();
            s.active_hours = "00:00-23:59".into();
            s.active_days = Vec::new();
            s.min_interval_secs = 60;
            s.max_interval_secs = 60;
        }
        cfg.normalize();
        // normalize refills voice days; clear again for an always-open window
        cfg.voice.active_days = Vec::new();
        cfg.sms.active_days = Vec::new();
        cfg
    }

    fn scheduler(channel: Channel, placement: Arc<FakePlacement>) -> (ChannelScheduler, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let s = ChannelScheduler::new(channel, &config(), placement, sink.clone());
        (s, sink)
    }

    fn now() -> Moment {
        Moment::from_utc(Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap())
    }

    fn completed(sid: &str) -> StatusNotification {
        StatusNotification {
            sid: sid.into(),
            status: ProviderStatus::Completed,
            duration_secs: Some(42),
            participants: Participants::default(),
        }
    }

    #[tokio::test]
    async fn test_first_tick_only_arms() {
        let placement = FakePlacement::new(false);
        let (s, _) = scheduler(Channel::Voice, placement.clone());
        let out = s.tick_at(now()).await;
        assert!(out.is_empty());
        assert_eq!(s.schedule().state().next_deadline, Some(now().epoch() + 60));
        assert_eq!(placement.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_timer_places_and_disarms() {
        let placement = FakePlacement::new(false);
        let (s, _) = scheduler(Channel::Voice, placement.clone());
        s.tick_at(now()).await;
        let out = s.tick_at(now().plus_secs(60)).await;
        let [CycleOutcome::Placed { sid, cause: Cause::Timer }] = out.as_slice() else {
            panic!("expected a placement, got {out:?}");
        };
        assert_eq!(s.lifecycle().current_in_flight().as_deref(), Some(sid.as_str()));
        assert_eq!(s.ledger().peek(DEST, now().epoch() + 60).last_hour, 1);
        assert_eq!(s.schedule().state().next_deadline, None);

        let req = placement.requests.lock().unwrap()[0].clone();
        assert_eq!(req.callbacks.status, "https://hooks.example.com/hooks/voice/status");
        assert!(req.body.is_none());

        let live = s.lifecycle().live(sid).unwrap();
        let params = live.params.unwrap();
        assert_eq!(params.persona.as_deref(), Some("man"));
        assert_eq!(params.variant, Some(0));
    }

    #[tokio::test]
    async fn test_placement_failure_leaves_no_trace() {
        let placement = FakePlacement::new(true);
        let (s, _) = scheduler(Channel::Voice, placement.clone());
        s.set_next_opening("Hello from the front desk").unwrap();
        s.request_immediate_attempt();
        let out = s.tick_at(now()).await;

        assert!(matches!(out.as_slice(), [CycleOutcome::Failed { cause: Cause::Manual, .. }]));
        assert!(s.lifecycle().current_in_flight().is_none());
        assert!(!s.lifecycle().is_busy());
        assert_eq!(s.ledger().peek(DEST, now().epoch()).last_day, 0);
        let deadline = s.schedule().state().next_deadline.unwrap();
        assert!(deadline > now().epoch());
        assert_eq!(s.last_error().unwrap().message, "Provider error: HTTP 503");
        // the one-shot opening survives for the next try
        assert_eq!(s.opening().peek().as_deref(), Some("Hello from the front desk"));
    }

    #[tokio::test]
    async fn test_success_clears_last_error_and_consumes_opening() {
        let placement = FakePlacement::new(true);
        let (s, _) = scheduler(Channel::Voice, placement.clone());
        s.set_next_opening("Custom opener").unwrap();
        s.request_immediate_attempt();
        s.tick_at(now()).await;
        assert!(s.last_error().is_some());

        placement.fail.store(false, Ordering::SeqCst);
        s.request_immediate_attempt();
        let out = s.tick_at(now().plus_secs(1)).await;
        let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
            panic!("expected a placement, got {out:?}");
        };
        assert!(s.last_error().is_none());
        assert!(s.opening().peek().is_none());
        let params = s.lifecycle().params_for(sid).unwrap();
        assert_eq!(params.opening.as_deref(), Some("Custom opener"));
    }

    #[tokio::test]
    async fn test_manual_request_denied_while_in_flight() {
        let placement = FakePlacement::new(false);
        let (s, _) = scheduler(Channel::Voice, placement.clone());
        s.request_immediate_attempt();
        s.tick_at(now()).await;

        s.request_immediate_attempt();
        s.request_immediate_attempt();
        let out = s.tick_at(now().plus_secs(5)).await;
        let [CycleOutcome::Denied { decision, cause: Cause::Manual }] = out.as_slice() else {
            panic!("expected one denial, got {out:?}");
        };
        assert_eq!(decision.codes(), vec!["already_in_progress"]);
        assert_eq!(placement.calls.load(Ordering::SeqCst), 1);
        // denial re-arms
        assert!(s.schedule().state().next_deadline.is_some());
    }

    #[tokio::test]
    async fn test_terminal_status_completes_and_rearms() {
        let placement = FakePlacement::new(false);
        let (s, sink) = scheduler(Channel::Voice, placement.clone());
        s.request_immediate_attempt();
        let out = s.tick_at(now()).await;
        let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
            panic!("expected a placement");
        };

        let ringing = StatusNotification {
            status: ProviderStatus::Ringing,
            ..completed(sid)
        };
        assert!(matches!(
            s.on_status(&ringing, now().utc),
            StatusEffect::Tracked(BeginOutcome::AlreadyTracked)
        ));
        s.on_partial(sid, "hello who is", now().utc);

        let done = now().plus_secs(50);
        let effect = s.on_status(&completed(sid), done.utc);
        assert!(matches!(effect, StatusEffect::Finished(CompleteOutcome::Completed(_))));
        assert!(s.lifecycle().current_in_flight().is_none());
        assert_eq!(s.schedule().state().next_deadline, Some(done.epoch() + 60));

        let persisted = sink.persisted.lock().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].duration_secs, Some(42));
        assert_eq!(persisted[0].provider_status.as_deref(), Some("completed"));
        assert_eq!(persisted[0].events.len(), 1);
        drop(persisted);

        // duplicate terminal callback does not persist or re-arm again
        let effect = s.on_status(&completed(sid), done.plus_secs(30).utc);
        assert_eq!(effect, StatusEffect::Finished(CompleteOutcome::Duplicate));
        assert_eq!(s.schedule().state().next_deadline, Some(done.epoch() + 60));
        assert_eq!(sink.persisted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_sid_terminal_is_recovered() {
        let (s, sink) = scheduler(Channel::Voice, FakePlacement::new(false));
        let mut n = completed("CAunknown0001");
        n.participants.destination = Some(DEST.into());
        let effect = s.on_status(&n, now().utc);
        assert!(matches!(effect, StatusEffect::Finished(CompleteOutcome::Recovered(_))));
        let persisted = sink.persisted.lock().unwrap();
        assert_eq!(persisted[0].destination, DEST);
        assert_eq!(persisted[0].state, AttemptState::Completed);
    }

    #[tokio::test]
    async fn test_sms_body_and_status_events() {
        let placement = FakePlacement::new(false);
        let (s, sink) = scheduler(Channel::Sms, placement.clone());
        s.set_next_opening("Your appointment is confirmed.").unwrap();
        s.request_immediate_attempt();
        let out = s.tick_at(now()).await;
        let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
            panic!("expected a placement");
        };
        let req = placement.requests.lock().unwrap()[0].clone();
        assert_eq!(req.body.as_deref(), Some("Your appointment is confirmed."));
        assert_eq!(req.callbacks.status, "https://hooks.example.com/hooks/sms/status");

        for status in [ProviderStatus::Sent, ProviderStatus::Delivered] {
            s.on_status(
                &StatusNotification {
                    status,
                    duration_secs: None,
                    ..completed(sid)
                },
                now().plus_secs(3).utc,
            );
        }
        let persisted = sink.persisted.lock().unwrap();
        let a = &persisted[0];
        assert_eq!(a.state, AttemptState::Completed);
        let texts: Vec<&str> = a.events.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Your appointment is confirmed.", "status: sent", "status: delivered"]
        );
    }

    #[tokio::test]
    async fn test_hourly_cap_denies_with_hint() {
        let placement = FakePlacement::new(false);
        let (s, _) = scheduler(Channel::Voice, placement.clone());
        let mut t = now();
        for _ in 0..3 {
            s.request_immediate_attempt();
            let out = s.tick_at(t).await;
            let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
                panic!("expected a placement, got {out:?}");
            };
            t = t.plus_secs(100);
            s.on_status(&completed(sid), t.utc);
        }
        s.request_immediate_attempt();
        let out = s.tick_at(t).await;
        let [CycleOutcome::Denied { decision, .. }] = out.as_slice() else {
            panic!("expected a denial, got {out:?}");
        };
        assert_eq!(decision.retry_after_secs(), Some(3300));

        let status = s.status(t);
        assert!(!status.can_attempt_now);
        assert_eq!(status.attempts_last_hour, 3);
        assert_eq!(status.retry_after_secs, Some(3300));
        assert_eq!(status.last_denial.unwrap().reasons, vec!["cap_reached"]);
    }

    #[tokio::test]
    async fn test_status_snapshot_idle() {
        let (s, _) = scheduler(Channel::Voice, FakePlacement::new(false));
        s.tick_at(now()).await;
        let status = s.status(now().plus_secs(10));
        assert!(status.enabled);
        assert!(!status.in_flight);
        assert!(status.can_attempt_now);
        assert!(status.window_open);
        assert!(status.ready);
        assert_eq!(status.seconds_until_next, Some(50));
        assert_eq!(status.interval_total, Some(60));
        assert_eq!(status.destination, "...0100");
    }

    #[tokio::test]
    async fn test_answer_returns_assigned_params() {
        let (s, _) = scheduler(Channel::Voice, FakePlacement::new(false));
        s.request_immediate_attempt();
        let out = s.tick_at(now()).await;
        let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
            panic!("expected a placement");
        };
        let p = s.answer(sid, &Participants::default(), now().utc);
        assert_eq!(p.persona.as_deref(), Some("man"));

        let fallback = s.answer("CAother00001", &Participants::default(), now().utc);
        assert_eq!(fallback.variant, Some(0));
    }

    #[tokio::test]
    async fn test_dialog_turns_are_logged() {
        let cfg = config();
        let (s, sink) = scheduler(Channel::Voice, FakePlacement::new(false));
        let script = DialogScript::new(&cfg.dialog);
        let responder = crate::dialog::FollowUpResponder;
        s.request_immediate_attempt();
        let out = s.tick_at(now()).await;
        let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
            panic!("expected a placement");
        };

        let opening = s.open_dialog(&script, sid, &Participants::default(), now().utc);
        assert_eq!(opening.persona.as_deref(), Some("man"));
        let first = s.continue_dialog(&script, &responder, sid, "hello?", now().utc);
        assert!(!first.hangup);
        let second = s.continue_dialog(&script, &responder, sid, "go on", now().utc);
        assert!(!second.hangup);
        assert_ne!(first.lines, second.lines);

        s.on_status(&completed(sid), now().plus_secs(30).utc);
        let persisted = sink.persisted.lock().unwrap();
        let roles: Vec<Role> = persisted[0].events.iter().map(|e| e.role).collect();
        assert_eq!(
            roles,
            vec![Role::Assistant, Role::Callee, Role::Assistant, Role::Callee, Role::Assistant]
        );
    }

    #[tokio::test]
    async fn test_terminal_callback_before_placement_returns() {
        let (s, placement, sink) = interleaved(vec![(None, ProviderStatus::Failed)]);
        s.request_immediate_attempt();
        let out = s.tick_at(now()).await;
        let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
            panic!("expected a placement, got {out:?}");
        };
        assert_eq!(
            *placement.slots_seen.lock().unwrap(),
            vec![Slot::Pending { since: now().utc }]
        );

        assert_eq!(s.lifecycle().slot(), Slot::Idle);
        assert_eq!(s.schedule().state().next_deadline, Some(now().epoch() + 60));
        assert_eq!(s.ledger().peek(DEST, now().epoch()).last_hour, 1);
        assert!(s.lifecycle().live(sid).is_none());
        {
            let persisted = sink.persisted.lock().unwrap();
            assert_eq!(persisted.len(), 1);
            assert_eq!(persisted[0].state, AttemptState::Failed);
        }

        // the channel keeps working afterwards
        s.request_immediate_attempt();
        let later = now().plus_secs(3600);
        let out = s.tick_at(later).await;
        assert!(
            matches!(out.as_slice(), [CycleOutcome::Placed { .. }]),
            "expected a placement, got {out:?}"
        );
        assert_eq!(s.lifecycle().slot(), Slot::Idle);
        assert!(s.status(later).last_denial.is_none());
    }

    #[tokio::test]
    async fn test_ringing_then_completed_before_placement_returns() {
        let (s, _, sink) = interleaved(vec![
            (None, ProviderStatus::Ringing),
            (None, ProviderStatus::Completed),
        ]);
        s.request_immediate_attempt();
        let out = s.tick_at(now()).await;
        assert!(matches!(out.as_slice(), [CycleOutcome::Placed { .. }]));
        assert_eq!(s.lifecycle().slot(), Slot::Idle);
        assert_eq!(s.lifecycle().in_flight_count(), 0);
        assert!(s.schedule().state().next_deadline.is_some());
        assert_eq!(sink.persisted.lock().unwrap()[0].state, AttemptState::Completed);
    }

    #[tokio::test]
    async fn test_ringing_before_placement_returns() {
        let (s, placement, _) = interleaved(vec![(None, ProviderStatus::Ringing)]);
        s.request_immediate_attempt();
        let out = s.tick_at(now()).await;
        let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
            panic!("expected a placement, got {out:?}");
        };
        assert_eq!(s.lifecycle().slot(), Slot::InFlight { sid: sid.clone() });
        assert_eq!(s.lifecycle().in_flight_count(), 1);
        assert_eq!(s.schedule().state().next_deadline, None);
        // placement parameters still land on the record the callback created
        let live = s.lifecycle().live(sid).unwrap();
        assert_eq!(live.destination, DEST);
        assert!(live.params.is_some());

        s.request_immediate_attempt();
        let out = s.tick_at(now().plus_secs(5)).await;
        let [CycleOutcome::Denied { decision, .. }] = out.as_slice() else {
            panic!("expected a denial, got {out:?}");
        };
        assert_eq!(decision.codes(), vec!["already_in_progress"]);
        assert_eq!(placement.calls.load(Ordering::SeqCst), 1);

        let done = now().plus_secs(40);
        s.on_status(&completed(sid), done.utc);
        assert_eq!(s.lifecycle().slot(), Slot::Idle);
        assert_eq!(s.schedule().state().next_deadline, Some(done.epoch() + 60));
    }

    #[tokio::test]
    async fn test_foreign_terminal_during_placement() {
        let (s, _, sink) = interleaved(vec![(Some("CAstray0001"), ProviderStatus::Completed)]);
        s.request_immediate_attempt();
        let out = s.tick_at(now()).await;
        let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
            panic!("expected a placement, got {out:?}");
        };
        // the stray completion neither freed nor took the reservation
        assert_eq!(s.lifecycle().slot(), Slot::InFlight { sid: sid.clone() });
        assert_eq!(s.lifecycle().in_flight_count(), 1);
        assert_eq!(s.schedule().state().next_deadline, None);
        let persisted = sink.persisted.lock().unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].sid, "CAstray0001");
    }

    #[tokio::test]
    async fn test_foreign_ringing_during_placement() {
        let (s, _, sink) = interleaved(vec![(Some("CAstray0002"), ProviderStatus::Ringing)]);
        s.request_immediate_attempt();
        let out = s.tick_at(now()).await;
        let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
            panic!("expected a placement, got {out:?}");
        };
        assert_eq!(s.lifecycle().current_in_flight().as_deref(), Some("CAstray0002"));
        assert_eq!(s.lifecycle().in_flight_count(), 1);
        assert_eq!(
            s.lifecycle().live(sid).unwrap().state,
            AttemptState::PendingPlacement
        );

        let t1 = now().plus_secs(20);
        s.on_status(&completed("CAstray0002"), t1.utc);
        assert_eq!(s.lifecycle().slot(), Slot::Idle);
        assert_eq!(s.schedule().state().next_deadline, Some(t1.epoch() + 60));

        let effect = s.on_status(&completed(sid), now().plus_secs(30).utc);
        assert!(matches!(effect, StatusEffect::Finished(CompleteOutcome::Completed(_))));
        assert_eq!(s.lifecycle().in_flight_count(), 0);
        assert_eq!(sink.persisted.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_reservation_expires() {
        let placement = FakePlacement::new(false);
        let (s, _) = scheduler(Channel::Voice, placement.clone());
        assert!(s.lifecycle().mark_pending(now().utc));

        s.request_immediate_attempt();
        let out = s.tick_at(now().plus_secs(5)).await;
        let [CycleOutcome::Denied { decision, .. }] = out.as_slice() else {
            panic!("expected a denial, got {out:?}");
        };
        assert_eq!(decision.codes(), vec!["placement_pending"]);

        s.request_immediate_attempt();
        let out = s.tick_at(now().plus_secs(crate::lifecycle::PENDING_TTL_SECS)).await;
        assert!(matches!(out.as_slice(), [CycleOutcome::Placed { .. }]));
        assert_eq!(placement.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_pooled_message_used_when_nothing_queued() {
        let pool = Arc::new(MessagePool::new(vec!["Pooled hello".into()]));
        let sink = Arc::new(RecordingSink::default());
        let voice =
            ChannelScheduler::new(Channel::Voice, &config(), FakePlacement::new(false), sink.clone())
                .with_messages(pool.clone());
        let sms_placement = FakePlacement::new(false);
        let sms = ChannelScheduler::new(Channel::Sms, &config(), sms_placement.clone(), sink)
            .with_messages(pool.clone());

        voice.request_immediate_attempt();
        let out = voice.tick_at(now()).await;
        let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
            panic!("expected a placement, got {out:?}");
        };
        let script = DialogScript::new(&config().dialog);
        let turn = voice.open_dialog(&script, sid, &Participants::default(), now().utc);
        assert_eq!(turn.lines, vec!["Pooled hello"]);

        sms.request_immediate_attempt();
        let out = sms.tick_at(now()).await;
        let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
            panic!("expected a placement, got {out:?}");
        };
        let req = sms_placement.requests.lock().unwrap()[0].clone();
        assert_eq!(req.body.as_deref(), Some("Pooled hello"));
        sms.on_status(&completed(sid), now().plus_secs(10).utc);

        // a queued one-shot still wins over the pool
        sms.set_next_opening("Queued text").unwrap();
        sms.request_immediate_attempt();
        sms.tick_at(now().plus_secs(120)).await;
        let req = sms_placement.requests.lock().unwrap()[1].clone();
        assert_eq!(req.body.as_deref(), Some("Queued text"));
    }

    #[tokio::test]
    async fn test_recording_status_attached() {
        let (s, sink) = scheduler(Channel::Voice, FakePlacement::new(false));
        s.request_immediate_attempt();
        let out = s.tick_at(now()).await;
        let [CycleOutcome::Placed { sid, .. }] = out.as_slice() else {
            panic!("expected a placement");
        };
        assert!(s.on_recording(sid, "RE0001", "in-progress", now().utc));
        assert!(!s.on_recording(sid, "", "completed", now().utc));
        s.on_status(&completed(sid), now().plus_secs(30).utc);
        assert!(s.on_recording(sid, "RE0001", "completed", now().plus_secs(35).utc));

        let persisted = sink.persisted.lock().unwrap();
        assert_eq!(persisted[0].recordings.len(), 1);
        assert_eq!(persisted[0].recordings[0].status, "completed");
    }

    #[tokio::test]
    async fn test_run_loop_places_on_manual_trigger_and_stops() {
        let placement = FakePlacement::new(false);
        let (s, _) = scheduler(Channel::Voice, placement.clone());
        let s = Arc::new(s);
        let (tx, rx) = watch::channel(false);
        let handle = spawn_scheduler(s.clone(), rx);

        s.request_immediate_attempt();
        let mut placed = false;
        for _ in 0..100 {
            if placement.calls.load(Ordering::SeqCst) > 0 {
                placed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(placed);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
