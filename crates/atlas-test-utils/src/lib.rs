//! Test doubles for the Atlas collaborator traits.
//!
//! Everything here is deterministic: scripted reasoning replies, tools with
//! fixed behaviour, an in-memory state store and a telemetry recorder.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use atlas_core::error::{AtlasError, Result};
use atlas_core::traits::{ReasoningBackend, StateStore, TelemetryEmitter, ToolBackend};
use atlas_core::types::{
    Completion, ModelTier, ReasoningRequest, RequestId, RunState, TelemetryEvent, ToolQuery,
};

// --- Reasoning ---

/// One scripted reply from the reasoning backend.
#[derive(Debug, Clone)]
pub enum Script {
    Reply(Completion),
    /// Fails with `AtlasError::ReasoningRequest`, retryable when the
    /// message looks transient.
    Error(String),
    /// Fails with `AtlasError::ReasoningRejected` (permanent).
    Reject(String),
    /// Never returns.
    Hang,
}

impl Script {
    pub fn text(text: impl Into<String>) -> Self {
        Script::Reply(Completion::text(text))
    }

    /// A reply delivered in several parts.
    pub fn segments<S: Into<String>>(parts: impl IntoIterator<Item = S>) -> Self {
        Script::Reply(Completion {
            segments: parts.into_iter().map(Into::into).collect(),
            total_tokens: None,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Script::Error(message.into())
    }

    pub fn reject(message: impl Into<String>) -> Self {
        Script::Reject(message.into())
    }

    pub fn hang() -> Self {
        Script::Hang
    }

    /// Attach token usage. No effect on non-reply scripts.
    pub fn with_tokens(self, tokens: u64) -> Self {
        match self {
            Script::Reply(c) => Script::Reply(c.with_tokens(tokens)),
            other => other,
        }
    }
}

#[derive(Default)]
struct Queue {
    scripted: VecDeque<Script>,
    fallback: Option<Script>,
}

impl Queue {
    fn next(&mut self) -> Option<Script> {
        self.scripted.pop_front().or_else(|| self.fallback.clone())
    }
}

#[derive(Default)]
struct ReasonerState {
    fast: Queue,
    deep: Queue,
    requests: Vec<ReasoningRequest>,
}

impl ReasonerState {
    fn queue(&mut self, tier: ModelTier) -> &mut Queue {
        match tier {
            ModelTier::Fast => &mut self.fast,
            ModelTier::Deep => &mut self.deep,
        }
    }
}

/// A reasoning backend that replays scripted replies per tier.
///
/// Replies are consumed in order; once a tier's queue is empty its
/// `always` script is used, and without one the call is rejected.
#[derive(Default)]
pub struct ScriptedReasoner {
    state: Mutex<ReasonerState>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the given tier.
    pub fn then(self, tier: ModelTier, script: Script) -> Self {
        self.lock().queue(tier).scripted.push_back(script);
        self
    }

    /// Reply used for the tier once its queue runs dry.
    pub fn always(self, tier: ModelTier, script: Script) -> Self {
        self.lock().queue(tier).fallback = Some(script);
        self
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<ReasoningRequest> {
        self.lock().requests.clone()
    }

    pub fn calls(&self, tier: ModelTier) -> usize {
        self.lock().requests.iter().filter(|r| r.tier == tier).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReasonerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ReasoningBackend for ScriptedReasoner {
    fn complete(&self, request: ReasoningRequest) -> BoxFuture<'_, Result<Completion>> {
        let tier = request.tier;
        let script = {
            let mut state = self.lock();
            state.requests.push(request);
            state.queue(tier).next()
        };
        Box::pin(async move {
            match script {
                Some(Script::Reply(completion)) => Ok(completion),
                Some(Script::Error(msg)) => Err(AtlasError::ReasoningRequest(msg)),
                Some(Script::Reject(msg)) => Err(AtlasError::ReasoningRejected(msg)),
                Some(Script::Hang) => std::future::pending().await,
                None => Err(AtlasError::ReasoningRejected(format!(
                    "no scripted reply left for {:?} tier",
                    tier
                ))),
            }
        })
    }
}

// --- Tools ---

#[derive(Debug, Clone)]
enum Behavior {
    Ok(serde_json::Value),
    Fail { transient: bool },
    Hang,
    /// Fail transiently for the first `failures` calls, then succeed.
    Flaky {
        payload: serde_json::Value,
        failures: usize,
    },
}

/// A tool backend with fixed behaviour and a call counter.
pub struct MockTool {
    name: String,
    behavior: Behavior,
    delay: Option<Duration>,
    freshness: Duration,
    calls: AtomicUsize,
}

impl MockTool {
    fn with_behavior(name: impl Into<String>, behavior: Behavior) -> Self {
        Self {
            name: name.into(),
            behavior,
            delay: None,
            freshness: Duration::from_secs(300),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn ok(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::with_behavior(name, Behavior::Ok(payload))
    }

    pub fn failing(name: impl Into<String>, transient: bool) -> Self {
        Self::with_behavior(name, Behavior::Fail { transient })
    }

    pub fn hanging(name: impl Into<String>) -> Self {
        Self::with_behavior(name, Behavior::Hang)
    }

    pub fn flaky(name: impl Into<String>, payload: serde_json::Value, failures: usize) -> Self {
        Self::with_behavior(name, Behavior::Flaky { payload, failures })
    }

    /// Sleep before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_freshness(mut self, freshness: Duration) -> Self {
        self.freshness = freshness;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn outage(&self, transient: bool) -> AtlasError {
        AtlasError::ToolExecution {
            tool: self.name.clone(),
            message: "simulated outage".into(),
            transient,
        }
    }
}

impl ToolBackend for MockTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, _query: ToolQuery, _as_of: DateTime<Utc>) -> BoxFuture<'_, Result<serde_json::Value>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.behavior {
                Behavior::Ok(payload) => Ok(payload.clone()),
                Behavior::Fail { transient } => Err(self.outage(*transient)),
                Behavior::Hang => std::future::pending().await,
                Behavior::Flaky { payload, failures } => {
                    if call < *failures {
                        Err(self.outage(true))
                    } else {
                        Ok(payload.clone())
                    }
                }
            }
        })
    }

    fn freshness(&self) -> Duration {
        self.freshness
    }
}

// --- State store ---

/// In-memory `StateStore` that counts writes.
#[derive(Default)]
pub struct MemoryStore {
    states: Mutex<HashMap<RequestId, RunState>>,
    fail: bool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Pre-seed a checkpoint.
    pub fn with_state(self, state: RunState) -> Self {
        self.lock().insert(state.request_id.clone(), state);
        self
    }

    pub fn get(&self, request_id: &RequestId) -> Option<RunState> {
        self.lock().get(request_id).cloned()
    }

    /// Successful checkpoint writes so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RequestId, RunState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StateStore for MemoryStore {
    fn checkpoint(&self, request_id: &RequestId, state: &RunState) -> BoxFuture<'_, Result<()>> {
        let request_id = request_id.clone();
        let state = state.clone();
        Box::pin(async move {
            if self.fail {
                return Err(AtlasError::Database("simulated store outage".into()));
            }
            self.lock().insert(request_id, state);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    fn load(&self, request_id: &RequestId) -> BoxFuture<'_, Result<Option<RunState>>> {
        let request_id = request_id.clone();
        Box::pin(async move {
            if self.fail {
                return Err(AtlasError::Database("simulated store outage".into()));
            }
            Ok(self.get(&request_id))
        })
    }
}

// --- Telemetry ---

/// Keeps every recorded event in order.
#[derive(Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.lock().clone()
    }

    /// Event names in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.lock().iter().map(TelemetryEvent::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.lock().iter().filter(|e| e.kind() == kind).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<TelemetryEvent>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl TelemetryEmitter for RecordingTelemetry {
    fn record(&self, event: TelemetryEvent) {
        self.lock().push(event);
    }
}

// --- Fixtures ---

/// Canned payloads and model replies.
pub mod fixtures {
    use chrono::{Duration, Utc};
    use serde_json::{json, Value};

    /// A traffic tool payload.
    pub fn traffic_payload(status: &str, duration_secs: u64) -> Value {
        json!({
            "distance_meters": 24000,
            "duration_seconds": duration_secs,
            "traffic_delay_seconds": duration_secs / 5,
            "status": status,
            "route_summary": "US-101 S",
        })
    }

    /// A flight tool payload departing `minutes_until_departure` from now.
    /// Delayed flights were scheduled 30 minutes earlier.
    pub fn flight_payload(flight: &str, status: &str, minutes_until_departure: i64) -> Value {
        let estimated = Utc::now() + Duration::minutes(minutes_until_departure);
        let scheduled = if status == "delayed" {
            estimated - Duration::minutes(30)
        } else {
            estimated
        };
        json!({
            "flight_number": flight,
            "status": status,
            "scheduled_departure": scheduled.to_rfc3339(),
            "estimated_departure": estimated.to_rfc3339(),
            "gate": "G12",
            "terminal": "3",
        })
    }

    /// A classifier reply for the given intent.
    pub fn classification_reply(intent: &str, flight: Option<&str>) -> String {
        let mut reply = json!({
            "intent": intent,
            "origin": "Home",
            "destination": "SFO",
        });
        if let Some(flight) = flight {
            reply["flight_number"] = json!(flight);
        }
        reply.to_string()
    }

    /// A reasoner reply carrying a plan.
    pub fn plan_reply(action: &str, buffer_minutes: f64) -> String {
        json!({
            "plan": {
                "metrics_analyzed": true,
                "buffer_minutes_remaining": buffer_minutes,
                "recommended_action": action,
                "reasoning_trace": format!("{} minutes of buffer remain", buffer_minutes),
                "notification_message": null,
            }
        })
        .to_string()
    }

    /// A reasoner reply asking for an earlier stage to be redone.
    pub fn revise_reply(stage: &str, reason: &str) -> String {
        json!({ "revise": { "stage": stage, "reason": reason } }).to_string()
    }
}
