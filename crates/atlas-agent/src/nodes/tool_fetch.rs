use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tracing::debug;

use atlas_core::config::ToolConfig;
use atlas_core::types::{RunState, Stage, StateDelta, ToolQuery, ToolRecord};

use crate::graph::context::RunContext;
use crate::graph::node::{Node, NodeResult, NodeSpec};

/// Build the backend query from the classified context, falling back to
/// the raw input for anything the classifier left empty.
pub fn tool_query(state: &RunState) -> ToolQuery {
    let input = &state.input;
    match state.working.classification {
        Some(ref c) => ToolQuery {
            origin: c.origin.clone().or_else(|| input.origin.clone()),
            destination: c.destination.clone().or_else(|| input.destination.clone()),
            flight_number: c.flight_number.clone().or_else(|| input.flight_number.clone()),
            target_arrival_time: c.target_arrival_time.or(input.target_arrival_time),
        },
        None => ToolQuery {
            origin: input.origin.clone(),
            destination: input.destination.clone(),
            flight_number: input.flight_number.clone(),
            target_arrival_time: input.target_arrival_time,
        },
    }
}

/// Fetches one external data source and records it with a validity window.
pub struct ToolFetchNode {
    tool: String,
    spec: NodeSpec,
    /// Overrides the backend's own freshness window.
    ttl: Option<Duration>,
}

impl ToolFetchNode {
    pub fn new(tool: impl Into<String>, spec: NodeSpec) -> Self {
        Self {
            tool: tool.into(),
            spec,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn from_config(config: &ToolConfig) -> Self {
        Self::new(
            config.name.clone(),
            NodeSpec::new(config.max_retries, config.timeout()),
        )
        .with_ttl(config.ttl())
    }

    async fn fetch(&self, state: &RunState, ctx: &RunContext) -> NodeResult {
        let backend = match ctx.tool(&self.tool) {
            Ok(b) => b,
            Err(e) => return NodeResult::fatal(e.to_string()),
        };

        let as_of = Utc::now();
        let payload = match backend.fetch(tool_query(state), as_of).await {
            Ok(p) => p,
            Err(e) => return NodeResult::from_error(&e),
        };

        let freshness = self.ttl.unwrap_or_else(|| backend.freshness());
        let degraded = payload
            .get("degraded")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let mut record = ToolRecord::new(&self.tool, payload, as_of, freshness);
        if degraded {
            debug!(tool = %self.tool, "Backend returned fallback data");
            record = record.degraded();
        }

        NodeResult::success(StateDelta::new().with_tool_result(record))
    }
}

impl Node for ToolFetchNode {
    fn name(&self) -> &str {
        &self.tool
    }

    fn stage(&self) -> Stage {
        Stage::ParallelFetch
    }

    fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    fn invoke<'a>(&'a self, state: &'a RunState, ctx: &'a RunContext) -> BoxFuture<'a, NodeResult> {
        Box::pin(self.fetch(state, ctx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use atlas_core::types::{Classification, NodeOutcome, QueryInput, RequestId};
    use atlas_test_utils::{fixtures, MockTool};

    fn ctx_with(tool: MockTool) -> RunContext {
        RunContext::new(RequestId::new(), Duration::from_secs(30)).with_tool(Arc::new(tool))
    }

    #[test]
    fn test_query_prefers_classification() {
        let mut state = RunState::new(RequestId::new(), "q").with_input(QueryInput {
            origin: Some("Input origin".into()),
            destination: Some("Input dest".into()),
            ..Default::default()
        });
        state.working.classification = Some(Classification {
            origin: Some("Home".into()),
            flight_number: Some("UA1".into()),
            ..Default::default()
        });
        let q = tool_query(&state);
        assert_eq!(q.origin.as_deref(), Some("Home"));
        assert_eq!(q.destination.as_deref(), Some("Input dest"));
        assert_eq!(q.flight_number.as_deref(), Some("UA1"));
    }

    #[tokio::test]
    async fn test_records_result_with_ttl() {
        let node = ToolFetchNode::new("traffic", NodeSpec::new(0, Duration::from_secs(5)))
            .with_ttl(Duration::from_secs(60));
        let ctx = ctx_with(MockTool::ok("traffic", fixtures::traffic_payload("clear", 1200)));
        let result = node.invoke(&RunState::new(RequestId::new(), "q"), &ctx).await;

        assert_eq!(result.outcome, NodeOutcome::Success);
        let record = &result.delta.tool_results[0];
        assert_eq!(record.tool, "traffic");
        assert!(!record.degraded);
        assert_eq!((record.valid_until - record.fetched_at).num_seconds(), 60);
    }

    #[tokio::test]
    async fn test_degraded_payload_flagged() {
        let mut payload = fixtures::flight_payload("UA123", "delayed", 90);
        payload["degraded"] = serde_json::json!(true);
        let node = ToolFetchNode::new("flight", NodeSpec::new(0, Duration::from_secs(5)));
        let result = node
            .invoke(&RunState::new(RequestId::new(), "q"), &ctx_with(MockTool::ok("flight", payload)))
            .await;
        assert!(result.delta.tool_results[0].degraded);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retriable() {
        let node = ToolFetchNode::new("traffic", NodeSpec::new(0, Duration::from_secs(5)));
        let result = node
            .invoke(&RunState::new(RequestId::new(), "q"), &ctx_with(MockTool::failing("traffic", true)))
            .await;
        assert_eq!(result.outcome, NodeOutcome::RetriableFailure);

        let result = node
            .invoke(&RunState::new(RequestId::new(), "q"), &ctx_with(MockTool::failing("traffic", false)))
            .await;
        assert_eq!(result.outcome, NodeOutcome::FatalFailure);
    }

    #[tokio::test]
    async fn test_unregistered_backend_is_fatal() {
        let node = ToolFetchNode::new("weather", NodeSpec::new(0, Duration::from_secs(5)));
        let ctx = RunContext::new(RequestId::new(), Duration::from_secs(30));
        let result = node.invoke(&RunState::new(RequestId::new(), "q"), &ctx).await;
        assert_eq!(result.outcome, NodeOutcome::FatalFailure);
        assert!(result.diagnostic.unwrap().contains("weather"));
    }
}
