use std::time::Duration;

use futures::future::BoxFuture;

use atlas_core::error::AtlasError;
use atlas_core::types::{NodeOutcome, RunState, Stage, StateDelta};

use super::context::RunContext;
use crate::recovery::OutputSchema;

/// Static limits and output shape of a node.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// Retries the executor grants this node before giving up.
    pub max_retries: u32,
    /// Per-invocation timeout; elapsed counts as a retriable failure.
    pub timeout: Duration,
    /// Keys the node's structured output must carry.
    pub schema: OutputSchema,
}

impl NodeSpec {
    pub fn new(max_retries: u32, timeout: Duration) -> Self {
        Self {
            max_retries,
            timeout,
            schema: OutputSchema::new(),
        }
    }

    pub fn with_schema(mut self, schema: OutputSchema) -> Self {
        self.schema = schema;
        self
    }
}

/// What a node hands back to the executor. Nodes never write state
/// directly; the delta is merged by the executor.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub delta: StateDelta,
    pub outcome: NodeOutcome,
    /// Human-readable reason, recorded as an error note.
    pub diagnostic: Option<String>,
    /// Stage a retriable failure asks to re-run. `None` means the node's own.
    pub retry_target: Option<Stage>,
}

impl NodeResult {
    pub fn success(delta: StateDelta) -> Self {
        Self {
            delta,
            outcome: NodeOutcome::Success,
            diagnostic: None,
            retry_target: None,
        }
    }

    pub fn retriable(diagnostic: impl Into<String>) -> Self {
        Self {
            delta: StateDelta::new(),
            outcome: NodeOutcome::RetriableFailure,
            diagnostic: Some(diagnostic.into()),
            retry_target: None,
        }
    }

    pub fn fatal(diagnostic: impl Into<String>) -> Self {
        Self {
            delta: StateDelta::new(),
            outcome: NodeOutcome::FatalFailure,
            diagnostic: Some(diagnostic.into()),
            retry_target: None,
        }
    }

    /// A retriable failure that sends the traversal back to an earlier stage.
    pub fn revise(target: Stage, reason: impl Into<String>) -> Self {
        Self {
            retry_target: Some(target),
            ..Self::retriable(reason)
        }
    }

    /// Classify a collaborator error as retriable or fatal.
    pub fn from_error(error: &AtlasError) -> Self {
        if error.is_retryable() {
            Self::retriable(error.to_string())
        } else {
            Self::fatal(error.to_string())
        }
    }

    pub fn with_delta(mut self, delta: StateDelta) -> Self {
        self.delta = delta;
        self
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = Some(diagnostic.into());
        self
    }
}

/// A unit of work in the graph.
///
/// Implementations read the snapshot they are given and return a delta.
/// The executor owns retries, timeouts and merging.
pub trait Node: Send + Sync + 'static {
    /// Unique node name; tool nodes use the tool name.
    fn name(&self) -> &str;

    fn stage(&self) -> Stage;

    fn spec(&self) -> &NodeSpec;

    fn invoke<'a>(&'a self, state: &'a RunState, ctx: &'a RunContext) -> BoxFuture<'a, NodeResult>;
}
