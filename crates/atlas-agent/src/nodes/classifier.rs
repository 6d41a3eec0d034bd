use std::sync::OnceLock;

use chrono::Utc;
use futures::future::BoxFuture;
use regex::Regex;
use tracing::{debug, warn};

use atlas_core::config::NodeConfig;
use atlas_core::types::{
    Classification, ModelTier, ReasoningRequest, RunState, Stage, StateDelta, TelemetryEvent,
};

use crate::graph::context::RunContext;
use crate::graph::node::{Node, NodeResult, NodeSpec};
use crate::healing;
use crate::prompt;
use crate::recovery::{self, OutputSchema};

pub const CLASSIFIER_NODE: &str = "classifier";

fn flight_number_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z0-9]{2,}\d+$").expect("valid flight number pattern"))
}

/// Normalize and check a flight number (`ua 123` becomes `UA123`).
pub fn normalize_flight_number(raw: &str) -> Option<String> {
    let compact: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_uppercase();
    flight_number_re().is_match(&compact).then_some(compact)
}

/// Extracts intent and travel entities from the user's query.
pub struct ClassifierNode {
    spec: NodeSpec,
    tier: ModelTier,
    instructions: Option<String>,
}

impl ClassifierNode {
    pub fn new(spec: NodeSpec, tier: ModelTier) -> Self {
        Self {
            spec: spec.with_schema(OutputSchema::new().require("intent")),
            tier,
            instructions: None,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        let mut node = Self::new(NodeSpec::new(config.max_retries, config.timeout()), config.tier);
        node.instructions = config.instructions.clone();
        node
    }

    async fn classify(&self, state: &RunState, ctx: &RunContext) -> NodeResult {
        let backend = match ctx.reasoning() {
            Ok(b) => b,
            Err(e) => return NodeResult::fatal(e.to_string()),
        };

        let request = ReasoningRequest {
            tier: self.tier,
            system: prompt::classifier_system(Utc::now(), self.instructions.as_deref()),
            prompt: prompt::classifier_prompt(&state.input),
            corrections: healing::corrections(state, CLASSIFIER_NODE),
            timeout: self.spec.timeout,
        };

        let completion = match backend.complete(request).await {
            Ok(c) => c,
            Err(e) => return NodeResult::from_error(&e),
        };
        if let Some(tokens) = completion.total_tokens {
            ctx.emit(TelemetryEvent::TokensUsed {
                request_id: ctx.request_id().clone(),
                node: CLASSIFIER_NODE.to_string(),
                tokens,
            });
        }

        let mut classification: Classification =
            match recovery::recover(&completion.segments, &self.spec.schema) {
                Ok(c) => c,
                Err(failure) => return NodeResult::retriable(failure.to_string()),
            };

        // Fields the caller supplied explicitly win over extracted ones.
        let input = &state.input;
        if input.origin.is_some() {
            classification.origin = input.origin.clone();
        }
        if input.destination.is_some() {
            classification.destination = input.destination.clone();
        }
        if input.target_arrival_time.is_some() {
            classification.target_arrival_time = input.target_arrival_time;
        }

        // A malformed flight number from the caller is dropped, not retried.
        let mut delta = StateDelta::new();
        if let Some(ref raw) = input.flight_number {
            match normalize_flight_number(raw) {
                Some(flight) => classification.flight_number = Some(flight),
                None => {
                    warn!(flight_number = %raw, "Ignoring malformed flight number from input");
                    delta = delta.with_note(format!(
                        "{}: ignored malformed input flight number '{}'",
                        CLASSIFIER_NODE, raw
                    ));
                }
            }
        }

        if let Some(raw) = classification.flight_number.take() {
            match normalize_flight_number(&raw) {
                Some(flight) => classification.flight_number = Some(flight),
                None => {
                    return NodeResult::retriable(format!(
                        "invalid flight number '{}': expected an airline code followed by digits",
                        raw
                    ))
                }
            }
        }

        debug!(intent = ?classification.intent, "Query classified");

        if let Some(ref user) = classification.user_id {
            delta = delta.with_user(user.clone());
        }
        NodeResult::success(delta.with_classification(classification))
    }
}

impl Node for ClassifierNode {
    fn name(&self) -> &str {
        CLASSIFIER_NODE
    }

    fn stage(&self) -> Stage {
        Stage::Classifying
    }

    fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    fn invoke<'a>(&'a self, state: &'a RunState, ctx: &'a RunContext) -> BoxFuture<'a, NodeResult> {
        Box::pin(self.classify(state, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use atlas_core::types::{Intent, NodeOutcome, QueryInput, RequestId};
    use atlas_test_utils::{RecordingTelemetry, Script, ScriptedReasoner};

    fn node() -> ClassifierNode {
        ClassifierNode::new(NodeSpec::new(3, Duration::from_secs(5)), ModelTier::Fast)
    }

    fn ctx(reasoner: Arc<ScriptedReasoner>) -> RunContext {
        RunContext::new(RequestId::from_str("r1"), Duration::from_secs(30)).with_reasoning(reasoner)
    }

    #[test]
    fn test_flight_number_format() {
        assert_eq!(normalize_flight_number("UA123").as_deref(), Some("UA123"));
        assert_eq!(normalize_flight_number("ua 450").as_deref(), Some("UA450"));
        assert_eq!(normalize_flight_number("B6-1234").as_deref(), Some("B61234"));
        assert!(normalize_flight_number("United").is_none());
        assert!(normalize_flight_number("1").is_none());
    }

    #[tokio::test]
    async fn test_classifies_and_proposes_user() {
        let reasoner = Arc::new(ScriptedReasoner::new().then(
            ModelTier::Fast,
            Script::text(r#"{"intent": "flight_departure_check", "flight_number": "ua123", "user_id": "u1"}"#)
                .with_tokens(42),
        ));
        let telemetry = Arc::new(RecordingTelemetry::new());
        let ctx = ctx(reasoner.clone()).with_telemetry(telemetry.clone());
        let state = RunState::new(RequestId::from_str("r1"), "Is UA123 on time?");

        let result = node().invoke(&state, &ctx).await;
        assert_eq!(result.outcome, NodeOutcome::Success);
        let c = result.delta.classification.unwrap();
        assert_eq!(c.intent, Intent::FlightDepartureCheck);
        assert_eq!(c.flight_number.as_deref(), Some("UA123"));
        assert_eq!(result.delta.user_id.as_deref(), Some("u1"));
        assert_eq!(telemetry.kinds(), vec!["tokens_used"]);
        assert_eq!(reasoner.requests()[0].tier, ModelTier::Fast);
    }

    #[tokio::test]
    async fn test_explicit_input_wins() {
        let reasoner = Arc::new(
            ScriptedReasoner::new().then(ModelTier::Fast, Script::text(r#"{"intent": "commute", "origin": "Work"}"#)),
        );
        let state = RunState::new(RequestId::new(), "drive home").with_input(QueryInput {
            query: "drive home".into(),
            origin: Some("Office".into()),
            ..Default::default()
        });
        let result = node().invoke(&state, &ctx(reasoner)).await;
        assert_eq!(result.delta.classification.unwrap().origin.as_deref(), Some("Office"));
    }

    #[tokio::test]
    async fn test_invalid_flight_number_is_retriable() {
        let reasoner = Arc::new(ScriptedReasoner::new().then(
            ModelTier::Fast,
            Script::text(r#"{"intent": "flight_departure_check", "flight_number": "the united one"}"#),
        ));
        let result = node().invoke(&RunState::new(RequestId::new(), "q"), &ctx(reasoner)).await;
        assert_eq!(result.outcome, NodeOutcome::RetriableFailure);
        assert!(result.diagnostic.unwrap().contains("invalid flight number"));
    }

    #[tokio::test]
    async fn test_malformed_input_flight_number_is_dropped() {
        let reasoner = Arc::new(ScriptedReasoner::new().then(ModelTier::Fast, Script::text(r#"{"intent": "commute"}"#)));
        let state = RunState::new(RequestId::new(), "drive to the airport").with_input(QueryInput {
            query: "drive to the airport".into(),
            flight_number: Some("United".into()),
            ..Default::default()
        });
        let result = node().invoke(&state, &ctx(reasoner)).await;
        assert_eq!(result.outcome, NodeOutcome::Success);
        assert!(result.delta.classification.unwrap().flight_number.is_none());
        assert!(result.delta.error_notes[0].contains("United"));
    }

    #[tokio::test]
    async fn test_malformed_input_flight_number_falls_back_to_extracted() {
        let reasoner = Arc::new(ScriptedReasoner::new().then(
            ModelTier::Fast,
            Script::text(r#"{"intent": "flight_departure_check", "flight_number": "dl 88"}"#),
        ));
        let state = RunState::new(RequestId::new(), "is DL88 on time").with_input(QueryInput {
            query: "is DL88 on time".into(),
            flight_number: Some("United".into()),
            ..Default::default()
        });
        let result = node().invoke(&state, &ctx(reasoner)).await;
        assert_eq!(result.outcome, NodeOutcome::Success);
        assert_eq!(result.delta.classification.unwrap().flight_number.as_deref(), Some("DL88"));
    }

    #[tokio::test]
    async fn test_input_flight_number_wins_when_valid() {
        let reasoner = Arc::new(ScriptedReasoner::new().then(
            ModelTier::Fast,
            Script::text(r#"{"intent": "flight_departure_check", "flight_number": "DL88"}"#),
        ));
        let state = RunState::new(RequestId::new(), "q").with_input(QueryInput {
            query: "q".into(),
            flight_number: Some("ua 450".into()),
            ..Default::default()
        });
        let result = node().invoke(&state, &ctx(reasoner)).await;
        assert_eq!(result.delta.classification.unwrap().flight_number.as_deref(), Some("UA450"));
    }

    #[tokio::test]
    async fn test_unparseable_reply_is_retriable() {
        let reasoner = Arc::new(ScriptedReasoner::new().then(ModelTier::Fast, Script::text("no idea")));
        let result = node().invoke(&RunState::new(RequestId::new(), "q"), &ctx(reasoner)).await;
        assert_eq!(result.outcome, NodeOutcome::RetriableFailure);
        assert!(result.delta.is_empty());
    }

    #[tokio::test]
    async fn test_backend_rejection_is_fatal() {
        let reasoner = Arc::new(ScriptedReasoner::new().then(ModelTier::Fast, Script::reject("invalid api key")));
        let result = node().invoke(&RunState::new(RequestId::new(), "q"), &ctx(reasoner)).await;
        assert_eq!(result.outcome, NodeOutcome::FatalFailure);
    }

    #[tokio::test]
    async fn test_corrections_sent_on_retry() {
        let reasoner = Arc::new(ScriptedReasoner::new().then(ModelTier::Fast, Script::text(r#"{"intent": "commute"}"#)));
        let mut state = RunState::new(RequestId::new(), "q");
        state.decision.error_notes.push("classifier: Output is not valid JSON".into());
        state.decision.attempts.insert(CLASSIFIER_NODE.into(), 1);
        node().invoke(&state, &ctx(reasoner.clone())).await;
        let sent = &reasoner.requests()[0].corrections;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("not valid JSON"));
    }
}
