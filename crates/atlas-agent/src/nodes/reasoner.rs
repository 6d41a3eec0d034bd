use chrono::Utc;
use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::{debug, info};

use atlas_core::config::NodeConfig;
use atlas_core::types::{
    CommutePlan, ModelTier, ReasoningRequest, RunState, Stage, StateDelta, TelemetryEvent,
};

use crate::graph::context::RunContext;
use crate::graph::node::{Node, NodeResult, NodeSpec};
use crate::healing;
use crate::prompt;
use crate::recovery::{self, OutputSchema};

pub const REASONER_NODE: &str = "reasoner";

#[derive(Debug, Deserialize)]
struct Revision {
    stage: Stage,
    #[serde(default)]
    reason: String,
}

/// The two reply shapes the reasoner accepts.
#[derive(Debug)]
enum Reply {
    Plan(CommutePlan),
    Revise(Revision),
}

fn interpret(value: serde_json::Value) -> Result<Reply, String> {
    if let Some(plan) = value.get("plan") {
        return serde_json::from_value(plan.clone())
            .map(Reply::Plan)
            .map_err(|e| format!("plan has the wrong shape: {}", e));
    }
    if let Some(revise) = value.get("revise") {
        return serde_json::from_value(revise.clone())
            .map(Reply::Revise)
            .map_err(|e| format!("revise directive has the wrong shape: {}", e));
    }
    // Some models answer with the bare plan object.
    serde_json::from_value(value)
        .map(Reply::Plan)
        .map_err(|_| "reply contained neither a plan nor a revise directive".to_string())
}

/// Synthesizes the final commute plan, or asks for an earlier stage to be
/// redone when the context looks wrong.
pub struct ReasonerNode {
    spec: NodeSpec,
    tier: ModelTier,
    instructions: Option<String>,
}

impl ReasonerNode {
    pub fn new(spec: NodeSpec, tier: ModelTier) -> Self {
        Self {
            spec,
            tier,
            instructions: None,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        let mut node = Self::new(NodeSpec::new(config.max_retries, config.timeout()), config.tier);
        node.instructions = config.instructions.clone();
        node
    }

    async fn reason(&self, state: &RunState, ctx: &RunContext) -> NodeResult {
        let backend = match ctx.reasoning() {
            Ok(b) => b,
            Err(e) => return NodeResult::fatal(e.to_string()),
        };

        let request = ReasoningRequest {
            tier: self.tier,
            system: prompt::reasoner_system(state, Utc::now(), self.instructions.as_deref()),
            prompt: prompt::REASONER_PROMPT.to_string(),
            corrections: healing::corrections(state, REASONER_NODE),
            timeout: self.spec.timeout,
        };

        let completion = match backend.complete(request).await {
            Ok(c) => c,
            Err(e) => return NodeResult::from_error(&e),
        };
        if let Some(tokens) = completion.total_tokens {
            ctx.emit(TelemetryEvent::TokensUsed {
                request_id: ctx.request_id().clone(),
                node: REASONER_NODE.to_string(),
                tokens,
            });
        }

        let value: serde_json::Value =
            match recovery::recover(&completion.segments, &OutputSchema::new()) {
                Ok(v) => v,
                Err(failure) => return NodeResult::retriable(failure.to_string()),
            };

        match interpret(value) {
            Ok(Reply::Plan(plan)) => {
                info!(
                    action = ?plan.recommended_action,
                    buffer_minutes = plan.buffer_minutes_remaining,
                    "Plan produced"
                );
                NodeResult::success(StateDelta::new().with_plan(plan))
            }
            Ok(Reply::Revise(revision)) => {
                debug!(target_stage = %revision.stage, reason = %revision.reason, "Reasoner requested revision");
                let reason = if revision.reason.is_empty() {
                    format!("revision of {} requested", revision.stage)
                } else {
                    revision.reason
                };
                NodeResult::revise(revision.stage, reason)
            }
            Err(reason) => NodeResult::retriable(reason),
        }
    }
}

impl Node for ReasonerNode {
    fn name(&self) -> &str {
        REASONER_NODE
    }

    fn stage(&self) -> Stage {
        Stage::Reasoning
    }

    fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    fn invoke<'a>(&'a self, state: &'a RunState, ctx: &'a RunContext) -> BoxFuture<'a, NodeResult> {
        Box::pin(self.reason(state, ctx))
    }
}
