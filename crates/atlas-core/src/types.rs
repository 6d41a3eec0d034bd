use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Tool name used by the built-in traffic lookup.
pub const TRAFFIC_TOOL: &str = "traffic";
/// Tool name used by the built-in flight status lookup.
pub const FLIGHT_TOOL: &str = "flight";

/// Unique request identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One named step in the fixed topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[serde(alias = "classifier", alias = "classify")]
    Classifying,
    #[serde(alias = "fetch", alias = "fetch_context", alias = "tools")]
    ParallelFetch,
    #[serde(alias = "reasoner", alias = "reason")]
    Reasoning,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Classifying => "classifying",
            Stage::ParallelFetch => "parallel_fetch",
            Stage::Reasoning => "reasoning",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome tag of a single node invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOutcome {
    Success,
    RetriableFailure,
    FatalFailure,
}

impl fmt::Display for NodeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOutcome::Success => write!(f, "success"),
            NodeOutcome::RetriableFailure => write!(f, "retriable_failure"),
            NodeOutcome::FatalFailure => write!(f, "fatal_failure"),
        }
    }
}

/// Quality/cost tier requested from the reasoning backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    #[default]
    Fast,
    Deep,
}

/// What the user is asking about. Decides which tools the fetch stage runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    FlightDepartureCheck,
    Commute,
    AirportTrip,
    #[default]
    #[serde(other)]
    General,
}

impl Intent {
    /// Tools this intent needs. `None` means every configured tool.
    pub fn required_tools(&self) -> Option<&'static [&'static str]> {
        match self {
            Intent::FlightDepartureCheck => Some(&[FLIGHT_TOOL]),
            Intent::Commute => Some(&[TRAFFIC_TOOL]),
            Intent::AirportTrip => Some(&[TRAFFIC_TOOL, FLIGHT_TOOL]),
            Intent::General => None,
        }
    }
}

// --- Input facet ---

/// The user's request as received. Every optional field defaults to empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryInput {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub flight_number: Option<String>,
    #[serde(default)]
    pub target_arrival_time: Option<DateTime<Utc>>,
}

// --- Working facet ---

/// Structured context extracted from the query by the classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default)]
    pub intent: Intent,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub origin: Option<String>,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub flight_number: Option<String>,
    #[serde(default)]
    pub target_arrival_time: Option<DateTime<Utc>>,
}

/// A tool result tagged with its validity window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRecord {
    pub tool: String,
    pub payload: serde_json::Value,
    pub fetched_at: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    /// Set when the backend returned a best-effort fallback.
    #[serde(default)]
    pub degraded: bool,
}

impl ToolRecord {
    pub fn new(
        tool: impl Into<String>,
        payload: serde_json::Value,
        fetched_at: DateTime<Utc>,
        freshness: Duration,
    ) -> Self {
        let window = chrono::Duration::from_std(freshness).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            tool: tool.into(),
            payload,
            fetched_at,
            valid_until: fetched_at + window,
            degraded: false,
        }
    }

    pub fn degraded(mut self) -> Self {
        self.degraded = true;
        self
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now <= self.valid_until
    }

    /// Decode the payload into a typed metrics struct.
    pub fn decode<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficStatus {
    Clear,
    Moderate,
    Heavy,
    Gridlock,
}

/// Payload returned by the traffic tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficMetrics {
    pub distance_meters: u64,
    pub duration_seconds: u64,
    #[serde(default)]
    pub traffic_delay_seconds: u64,
    pub status: TrafficStatus,
    #[serde(default)]
    pub route_summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlightStatus {
    OnTime,
    Delayed,
    Cancelled,
    Boarding,
}

/// Payload returned by the flight tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightMetrics {
    pub flight_number: String,
    pub status: FlightStatus,
    pub scheduled_departure: DateTime<Utc>,
    pub estimated_departure: DateTime<Utc>,
    #[serde(default)]
    pub gate: Option<String>,
    #[serde(default)]
    pub terminal: Option<String>,
}

/// Working data accumulated by the classifier and the tool nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkingFacet {
    #[serde(default)]
    pub classification: Option<Classification>,
    #[serde(default)]
    pub tool_results: BTreeMap<String, ToolRecord>,
}

// --- Decision facet ---

/// Bookkeeping for the retry and self-correction loop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionFacet {
    #[serde(default)]
    pub last_outcome: Option<NodeOutcome>,
    #[serde(default)]
    pub last_completed: Option<Stage>,
    /// Retries taken so far, keyed by node (or stage) name.
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    #[serde(default)]
    pub cross_stage_retries: u32,
    #[serde(default)]
    pub error_notes: Vec<String>,
    /// Oldest notes pushed out by the note cap.
    #[serde(default)]
    pub notes_evicted: u32,
    /// Node names in invocation order.
    #[serde(default)]
    pub trace: Vec<String>,
    /// Set once the traversal has reached a terminal outcome.
    #[serde(default)]
    pub finished: bool,
}

// --- Output facet ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Wait,
    NudgeLeaveNow,
    NudgeBookUber,
}

/// The final plan produced by the reasoner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommutePlan {
    #[serde(default = "default_true")]
    pub metrics_analyzed: bool,
    pub buffer_minutes_remaining: f64,
    pub recommended_action: DecisionAction,
    #[serde(default)]
    pub reasoning_trace: String,
    #[serde(default)]
    pub notification_message: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputFacet {
    #[serde(default)]
    pub plan: Option<CommutePlan>,
}

/// The single record threaded through a traversal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub request_id: RequestId,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub input: QueryInput,
    #[serde(default)]
    pub working: WorkingFacet,
    #[serde(default)]
    pub decision: DecisionFacet,
    #[serde(default)]
    pub output: OutputFacet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunState {
    pub fn new(request_id: RequestId, query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            request_id,
            user_id: None,
            input: QueryInput {
                query: query.into(),
                ..QueryInput::default()
            },
            working: WorkingFacet::default(),
            decision: DecisionFacet::default(),
            output: OutputFacet::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_input(mut self, input: QueryInput) -> Self {
        self.input = input;
        self
    }

    /// Whether an identity has been established.
    pub fn has_user(&self) -> bool {
        self.user_id.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    /// Retries taken so far by a node.
    pub fn attempts(&self, node: &str) -> u32 {
        self.decision.attempts.get(node).copied().unwrap_or(0)
    }

    pub fn tool_result(&self, tool: &str) -> Option<&ToolRecord> {
        self.working.tool_results.get(tool)
    }

    pub fn plan(&self) -> Option<&CommutePlan> {
        self.output.plan.as_ref()
    }

    /// The most recent `n` error notes, oldest first.
    pub fn recent_notes(&self, n: usize) -> &[String] {
        let notes = &self.decision.error_notes;
        &notes[notes.len().saturating_sub(n)..]
    }
}

/// A partial update proposed by a node. The executor merges it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateDelta {
    pub user_id: Option<String>,
    pub classification: Option<Classification>,
    pub tool_results: Vec<ToolRecord>,
    pub plan: Option<CommutePlan>,
    pub last_outcome: Option<NodeOutcome>,
    pub last_completed: Option<Stage>,
    pub error_notes: Vec<String>,
    pub trace: Vec<String>,
}

impl StateDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn with_tool_result(mut self, record: ToolRecord) -> Self {
        self.tool_results.push(record);
        self
    }

    pub fn with_plan(mut self, plan: CommutePlan) -> Self {
        self.plan = Some(plan);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.error_notes.push(note.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

// --- External collaborator payloads ---

/// Prompt context sent to the reasoning backend.
#[derive(Debug, Clone)]
pub struct ReasoningRequest {
    pub tier: ModelTier,
    pub system: String,
    pub prompt: String,
    /// Self-correction hints from earlier failed attempts.
    pub corrections: Vec<String>,
    pub timeout: Duration,
}

/// Raw response from the reasoning backend.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    /// Response parts in the order produced.
    pub segments: Vec<String>,
    pub total_tokens: Option<u64>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            segments: vec![text.into()],
            total_tokens: None,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.total_tokens = Some(tokens);
        self
    }
}

/// Query handed to a tool backend, built from the classified context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolQuery {
    pub origin: Option<String>,
    pub destination: Option<String>,
    pub flight_number: Option<String>,
    pub target_arrival_time: Option<DateTime<Utc>>,
}

// --- Failure reporting ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    FatalNodeFailure,
    TraversalTimeout,
    Cancelled,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::FatalNodeFailure => write!(f, "fatal node failure"),
            FailureKind::TraversalTimeout => write!(f, "traversal timeout"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Structured failure returned to the caller when no plan could be produced.
#[derive(Debug, Clone)]
pub struct FailureReport {
    pub kind: FailureKind,
    pub stage: Option<Stage>,
    pub node: Option<String>,
    pub last_diagnostic: Option<String>,
    /// Retries taken by the failing node when the traversal stopped.
    pub attempts: u32,
    /// Authoritative state at the moment of failure.
    pub state: Box<RunState>,
}

impl fmt::Display for FailureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(stage) = self.stage {
            write!(f, " in stage {}", stage)?;
        }
        if let Some(ref node) = self.node {
            write!(f, " (node {}, {} retries)", node, self.attempts)?;
        }
        if let Some(ref diag) = self.last_diagnostic {
            write!(f, ": {}", diag)?;
        }
        Ok(())
    }
}

impl std::error::Error for FailureReport {}

// --- Telemetry ---

/// Event emitted per node invocation and per stage transition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    TraversalStarted {
        request_id: RequestId,
    },
    NodeStarted {
        request_id: RequestId,
        node: String,
        stage: Stage,
        attempt: u32,
    },
    NodeFinished {
        request_id: RequestId,
        node: String,
        stage: Stage,
        outcome: NodeOutcome,
        elapsed_ms: u64,
    },
    StageTransition {
        request_id: RequestId,
        from: Stage,
        to: Stage,
    },
    RetryScheduled {
        request_id: RequestId,
        from: Stage,
        target: Stage,
        attempt: u32,
        cross_stage_retries: u32,
    },
    DegradedPass {
        request_id: RequestId,
        missing: Vec<String>,
    },
    TokensUsed {
        request_id: RequestId,
        node: String,
        tokens: u64,
    },
    CheckpointFailed {
        request_id: RequestId,
        error: String,
    },
    TraversalCompleted {
        request_id: RequestId,
        elapsed_ms: u64,
    },
    TraversalFailed {
        request_id: RequestId,
        kind: FailureKind,
        stage: Option<Stage>,
        elapsed_ms: u64,
    },
}

impl TelemetryEvent {
    pub fn request_id(&self) -> &RequestId {
        match self {
            TelemetryEvent::TraversalStarted { request_id }
            | TelemetryEvent::NodeStarted { request_id, .. }
            | TelemetryEvent::NodeFinished { request_id, .. }
            | TelemetryEvent::StageTransition { request_id, .. }
            | TelemetryEvent::RetryScheduled { request_id, .. }
            | TelemetryEvent::DegradedPass { request_id, .. }
            | TelemetryEvent::TokensUsed { request_id, .. }
            | TelemetryEvent::CheckpointFailed { request_id, .. }
            | TelemetryEvent::TraversalCompleted { request_id, .. }
            | TelemetryEvent::TraversalFailed { request_id, .. } => request_id,
        }
    }

    /// Short event name, matching the serialized `event` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::TraversalStarted { .. } => "traversal_started",
            TelemetryEvent::NodeStarted { .. } => "node_started",
            TelemetryEvent::NodeFinished { .. } => "node_finished",
            TelemetryEvent::StageTransition { .. } => "stage_transition",
            TelemetryEvent::RetryScheduled { .. } => "retry_scheduled",
            TelemetryEvent::DegradedPass { .. } => "degraded_pass",
            TelemetryEvent::TokensUsed { .. } => "tokens_used",
            TelemetryEvent::CheckpointFailed { .. } => "checkpoint_failed",
            TelemetryEvent::TraversalCompleted { .. } => "traversal_completed",
            TelemetryEvent::TraversalFailed { .. } => "traversal_failed",
        }
    }

    /// Whether this event ends a traversal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TelemetryEvent::TraversalCompleted { .. } | TelemetryEvent::TraversalFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_input_defaults_safely() {
        let state: RunState = serde_json::from_value(serde_json::json!({
            "request_id": "r1",
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(state.request_id, RequestId::from_str("r1"));
        assert!(state.user_id.is_none());
        assert!(state.input.query.is_empty());
        assert!(state.working.tool_results.is_empty());
        assert_eq!(state.attempts("classifier"), 0);
    }

    #[test]
    fn unknown_intent_maps_to_general() {
        let c: Classification = serde_json::from_str(r#"{"intent": "weather_check"}"#).unwrap();
        assert_eq!(c.intent, Intent::General);
        assert!(c.intent.required_tools().is_none());

        let c: Classification = serde_json::from_str(r#"{"intent": "flight_departure_check"}"#).unwrap();
        assert_eq!(c.intent.required_tools(), Some(&[FLIGHT_TOOL][..]));
    }

    #[test]
    fn stage_accepts_loose_names() {
        let s: Stage = serde_json::from_str(r#""classifier""#).unwrap();
        assert_eq!(s, Stage::Classifying);
        let s: Stage = serde_json::from_str(r#""fetch""#).unwrap();
        assert_eq!(s, Stage::ParallelFetch);
        assert_eq!(Stage::Reasoning.to_string(), "reasoning");
    }

    #[test]
    fn tool_record_freshness_window() {
        let now = Utc::now();
        let record = ToolRecord::new("traffic", serde_json::json!({}), now, Duration::from_secs(60));
        assert!(record.is_fresh(now));
        assert!(record.is_fresh(now + chrono::Duration::seconds(60)));
        assert!(!record.is_fresh(now + chrono::Duration::seconds(61)));
        assert!(!record.degraded);
        assert!(record.degraded().degraded);
    }

    #[test]
    fn tool_record_decodes_typed_payload() {
        let record = ToolRecord::new(
            TRAFFIC_TOOL,
            serde_json::json!({
                "distance_meters": 12000,
                "duration_seconds": 1800,
                "status": "heavy",
                "route_summary": "I-405 N"
            }),
            Utc::now(),
            Duration::from_secs(300),
        );
        let traffic: TrafficMetrics = record.decode().unwrap();
        assert_eq!(traffic.status, TrafficStatus::Heavy);
        assert_eq!(traffic.traffic_delay_seconds, 0);
        assert!(record.decode::<FlightMetrics>().is_none());
    }

    #[test]
    fn recent_notes_returns_tail() {
        let mut state = RunState::new(RequestId::new(), "q");
        state.decision.error_notes = vec!["a".into(), "b".into(), "c".into()];
        assert_eq!(state.recent_notes(2), &["b".to_string(), "c".to_string()]);
        assert_eq!(state.recent_notes(10).len(), 3);
    }

    #[test]
    fn failure_report_display_names_stage() {
        let report = FailureReport {
            kind: FailureKind::FatalNodeFailure,
            stage: Some(Stage::Classifying),
            node: Some("classifier".into()),
            last_diagnostic: Some("cross-stage retry budget exhausted".into()),
            attempts: 2,
            state: Box::new(RunState::new(RequestId::from_str("r"), "q")),
        };
        let text = report.to_string();
        assert!(text.contains("classifying"));
        assert!(text.contains("classifier"));
        assert!(text.contains("budget exhausted"));
    }

    #[test]
    fn telemetry_event_serializes_with_tag() {
        let event = TelemetryEvent::StageTransition {
            request_id: RequestId::from_str("r1"),
            from: Stage::Classifying,
            to: Stage::ParallelFetch,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "stage_transition");
        assert_eq!(json["to"], "parallel_fetch");
        assert_eq!(event.kind(), "stage_transition");
        assert!(!event.is_terminal());
    }
}
