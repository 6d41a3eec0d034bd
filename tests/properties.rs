use std::sync::Arc;
use std::time::Duration;

use atlas_agent::graph::merge;
use atlas_agent::recovery::{recover, OutputSchema};
use atlas_agent::{
    ClassifierNode, ExecutorLimits, GraphExecutor, MergeLimits, NodeSpec, ReasonerNode, RunContext,
};
use atlas_core::types::{ModelTier, RequestId, RunState, StateDelta, TelemetryEvent};
use atlas_test_utils::{RecordingTelemetry, Script, ScriptedReasoner};
use proptest::prelude::*;
use serde_json::{json, Value};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[test]
fn test_scenario_b_literal() {
    let raw = "Sure! ```json\n{\"intent\": \"commute\"}\n``` Hope that helps!";
    let value: Value = recover(&[raw], &OutputSchema::new()).unwrap();
    assert_eq!(value, json!({"intent": "commute"}));
}

proptest! {
    #[test]
    fn prop_payload_in_prose_is_recovered(
        prefix in "[a-zA-Z0-9 .,!?:\n]{0,60}",
        suffix in "[a-zA-Z0-9 .,!?:\n]{0,60}",
        intent in "[a-z_]{1,20}",
        origin in "[a-zA-Z ]{0,20}",
        minutes in -500i64..5000,
    ) {
        let payload = json!({"intent": intent, "origin": origin, "minutes": minutes});
        let text = format!("{}{}{}", prefix, payload, suffix);
        let value: Value = recover(&[text.as_str()], &OutputSchema::new().require("intent")).unwrap();
        prop_assert_eq!(value, payload);
    }

    #[test]
    fn prop_split_segments_are_concatenated(
        intent in "[a-z_]{1,20}",
        cut in 0usize..64,
    ) {
        let text = format!("Here you go: {} done", json!({"intent": intent}));
        let cut = cut.min(text.len());
        let (head, tail) = text.split_at(cut);
        let value: Value = recover(&[head, tail], &OutputSchema::new()).unwrap();
        prop_assert_eq!(value, json!({"intent": intent}));
    }

    #[test]
    fn prop_no_object_yields_parse_failure(text in "[^{]{0,120}") {
        let result: Result<Value, _> = recover(&[text.as_str()], &OutputSchema::new());
        let failure = result.unwrap_err();
        prop_assert_eq!(failure.raw, text);
    }

    #[test]
    fn prop_identity_is_monotonic(
        user in "[a-z0-9]{1,12}",
        proposals in proptest::collection::vec(proptest::option::of("[a-z0-9 ]{0,12}"), 1..6),
    ) {
        let mut state = RunState::new(RequestId::from_str("r"), "q").with_user(user.clone());
        for proposal in proposals {
            let mut delta = StateDelta::new().with_note("tick");
            delta.user_id = proposal;
            state = merge(&state, &delta, &MergeLimits::default());
            prop_assert_eq!(state.user_id.as_deref(), Some(user.as_str()));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_always_failing_traversal_terminates_within_budgets(
        max_retries in 0u32..4,
        max_cross in 0u32..5,
    ) {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let reasoner = ScriptedReasoner::new().always(ModelTier::Fast, Script::text("no structure here"));
        let ctx = RunContext::new(RequestId::from_str("prop"), Duration::from_secs(60))
            .with_reasoning(Arc::new(reasoner))
            .with_telemetry(telemetry.clone());
        let executor = GraphExecutor::new(
            Arc::new(ClassifierNode::new(NodeSpec::new(max_retries, Duration::from_secs(5)), ModelTier::Fast)),
            Arc::new(ReasonerNode::new(NodeSpec::new(max_retries, Duration::from_secs(5)), ModelTier::Deep)),
        )
        .with_limits(ExecutorLimits {
            max_cross_stage_retries: max_cross,
            stage_timeout: Duration::from_secs(5),
            fetch_max_retries: 1,
            merge: MergeLimits::default(),
        });

        let report = runtime()
            .block_on(executor.run(RunState::new(RequestId::from_str("prop"), "q"), &ctx))
            .unwrap_err();

        let state = &report.state;
        prop_assert!(state.attempts("classifier") <= max_retries);
        prop_assert!(state.decision.cross_stage_retries <= max_cross);
        prop_assert_eq!(
            state.attempts("classifier"),
            max_retries.min(max_cross)
        );
        for event in telemetry.events() {
            if let TelemetryEvent::RetryScheduled { attempt, cross_stage_retries, .. } = event {
                prop_assert!(attempt <= max_retries);
                prop_assert!(cross_stage_retries <= max_cross);
            }
        }
    }
}
