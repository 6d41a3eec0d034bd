use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use atlas_core::config::{AppConfig, GraphConfig};
use atlas_core::types::{
    FailureKind, FailureReport, NodeOutcome, RunState, Stage, StateDelta, TelemetryEvent,
};

use super::context::RunContext;
use super::merge::{merge, MergeLimits};
use super::node::{Node, NodeResult};
use super::transition::{completed_before, gate, resume_point, route, Budget, Transition, Verdict};
use crate::nodes::{ClassifierNode, ReasonerNode, ToolFetchNode};

/// Attempt-counter key for the fetch stage as a whole.
pub const FETCH_STAGE_KEY: &str = "parallel_fetch";

/// Traversal-wide bounds.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorLimits {
    /// Retry transitions allowed per traversal, across all stages.
    pub max_cross_stage_retries: u32,
    /// Deadline for the whole fetch fan-out.
    pub stage_timeout: Duration,
    /// Times the fetch stage may re-run itself before a degraded pass.
    pub fetch_max_retries: u32,
    pub merge: MergeLimits,
}

impl ExecutorLimits {
    pub fn from_config(config: &GraphConfig) -> Self {
        Self {
            max_cross_stage_retries: config.max_cross_stage_retries,
            stage_timeout: config.stage_timeout(),
            fetch_max_retries: config.fetch_max_retries,
            merge: MergeLimits {
                max_error_notes: config.max_error_notes,
            },
        }
    }
}

impl Default for ExecutorLimits {
    fn default() -> Self {
        Self::from_config(&GraphConfig::default())
    }
}

/// Mutable progress of one traversal. Owned by the executor only.
struct Traversal {
    state: RunState,
    stage: Stage,
    /// Tools the fetch stage still owes when it re-runs itself.
    rerun_tools: Option<Vec<String>>,
    last_node: Option<String>,
}

/// How one stage went.
struct StageReport {
    verdict: Verdict,
    node: String,
    diagnostic: Option<String>,
    /// Tools with no usable result after the fetch stage.
    missing: Vec<String>,
    /// Tools worth re-running in a fetch self-retry.
    rerun: Vec<String>,
}

impl StageReport {
    fn single(node: &str, outcome: NodeOutcome, diagnostic: Option<String>, target: Stage) -> Self {
        let verdict = match outcome {
            NodeOutcome::Success => Verdict::Success,
            NodeOutcome::RetriableFailure => Verdict::Retriable { target },
            NodeOutcome::FatalFailure => Verdict::Fatal,
        };
        Self {
            verdict,
            node: node.to_string(),
            diagnostic,
            missing: Vec::new(),
            rerun: Vec::new(),
        }
    }
}

/// Why a traversal stopped short of a plan.
enum Halt {
    Failed {
        stage: Stage,
        node: String,
        diagnostic: Option<String>,
    },
    TimedOut,
    Cancelled,
}

/// A tool node that has settled, possibly after in-place retries.
struct SettledTool {
    name: String,
    result: NodeResult,
    retries: u32,
}

/// Drives the fixed `Classifying -> ParallelFetch -> Reasoning` machine.
///
/// The executor is the only writer of `RunState` during a traversal: nodes
/// return deltas and the executor merges them, counts retries, enforces
/// deadlines and checkpoints after each step.
pub struct GraphExecutor {
    classifier: Arc<dyn Node>,
    reasoner: Arc<dyn Node>,
    tools: Vec<Arc<dyn Node>>,
    limits: ExecutorLimits,
}

impl GraphExecutor {
    pub fn new(classifier: Arc<dyn Node>, reasoner: Arc<dyn Node>) -> Self {
        Self {
            classifier,
            reasoner,
            tools: Vec::new(),
            limits: ExecutorLimits::default(),
        }
    }

    /// Add a node to the fetch stage.
    pub fn with_tool(mut self, node: Arc<dyn Node>) -> Self {
        self.tools.push(node);
        self
    }

    pub fn with_limits(mut self, limits: ExecutorLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Build the standard graph from configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        let mut executor = Self::new(
            Arc::new(ClassifierNode::from_config(&config.classifier)),
            Arc::new(ReasonerNode::from_config(&config.reasoner)),
        )
        .with_limits(ExecutorLimits::from_config(&config.graph));
        for tool in &config.tools {
            executor = executor.with_tool(Arc::new(ToolFetchNode::from_config(tool)));
        }
        executor
    }

    pub fn limits(&self) -> &ExecutorLimits {
        &self.limits
    }

    /// Run a traversal from the classifier stage.
    pub async fn run(&self, initial: RunState, ctx: &RunContext) -> Result<RunState, FailureReport> {
        self.traverse(initial, Stage::Classifying, ctx).await
    }

    /// Continue a checkpointed traversal after its last completed stage.
    pub async fn resume(&self, checkpoint: RunState, ctx: &RunContext) -> Result<RunState, FailureReport> {
        match resume_point(checkpoint.decision.last_completed) {
            Some(stage) => {
                info!(request_id = %checkpoint.request_id, stage = %stage, "Resuming traversal");
                self.traverse(checkpoint, stage, ctx).await
            }
            None => Ok(checkpoint),
        }
    }

    async fn traverse(&self, mut initial: RunState, entry: Stage, ctx: &RunContext) -> Result<RunState, FailureReport> {
        let started = Instant::now();
        let deadline = started + ctx.timeout();
        initial.decision.finished = false;

        info!(request_id = %ctx.request_id(), entry = %entry, "Traversal started");
        ctx.emit(TelemetryEvent::TraversalStarted {
            request_id: ctx.request_id().clone(),
        });

        let mut t = Traversal {
            state: initial,
            stage: entry,
            rerun_tools: None,
            last_node: None,
        };

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => Err(Halt::Cancelled),
            r = tokio::time::timeout_at(deadline, async {
                self.recover_identity(&mut t, ctx).await;
                self.drive(&mut t, ctx).await
            }) => r.unwrap_or(Err(Halt::TimedOut)),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(()) => {
                t.state.decision.finished = true;
                self.checkpoint(&t.state, ctx).await;
                info!(request_id = %ctx.request_id(), elapsed_ms, "Traversal completed");
                ctx.emit(TelemetryEvent::TraversalCompleted {
                    request_id: ctx.request_id().clone(),
                    elapsed_ms,
                });
                Ok(t.state)
            }
            Err(halt) => {
                let cancelled = matches!(halt, Halt::Cancelled);
                let report = self.report(halt, t, ctx);
                // Nothing is written once cancellation has been observed.
                if !cancelled {
                    self.checkpoint(&report.state, ctx).await;
                }
                warn!(
                    request_id = %ctx.request_id(),
                    kind = %report.kind,
                    stage = ?report.stage,
                    elapsed_ms,
                    "Traversal failed"
                );
                ctx.emit(TelemetryEvent::TraversalFailed {
                    request_id: ctx.request_id().clone(),
                    kind: report.kind,
                    stage: report.stage,
                    elapsed_ms,
                });
                Err(report)
            }
        }
    }

    async fn drive(&self, t: &mut Traversal, ctx: &RunContext) -> Result<(), Halt> {
        loop {
            let from = t.stage;
            let report = match from {
                Stage::Classifying => self.run_single(&self.classifier, t, ctx).await?,
                Stage::ParallelFetch => self.run_fetch(t, ctx).await?,
                Stage::Reasoning => self.run_single(&self.reasoner, t, ctx).await?,
            };

            let proposed = route(from, report.verdict);
            let (transition, exhausted) = match proposed {
                Transition::Retry(target) => gate(from, proposed, &self.budget(&t.state, target)),
                other => (other, None),
            };

            match transition {
                Transition::Advance(next) => {
                    if !report.missing.is_empty() {
                        self.degraded_pass(t, &report.missing, ctx);
                    }
                    t.state.decision.last_completed = Some(from);
                    t.stage = next;
                    t.rerun_tools = None;
                    debug!(from = %from, to = %next, "Stage transition");
                    ctx.emit(TelemetryEvent::StageTransition {
                        request_id: ctx.request_id().clone(),
                        from,
                        to: next,
                    });
                    self.checkpoint(&t.state, ctx).await;
                }
                Transition::Retry(target) => {
                    let key = self.budget_key(target).to_string();
                    let attempt = {
                        let counter = t.state.decision.attempts.entry(key).or_insert(0);
                        *counter += 1;
                        *counter
                    };
                    t.state.decision.cross_stage_retries += 1;
                    t.state.decision.last_completed = completed_before(target);
                    t.rerun_tools = (from == Stage::ParallelFetch && target == Stage::ParallelFetch)
                        .then(|| report.rerun.clone());
                    t.stage = target;

                    info!(
                        from = %from,
                        target = %target,
                        attempt,
                        cross_stage_retries = t.state.decision.cross_stage_retries,
                        diagnostic = report.diagnostic.as_deref().unwrap_or(""),
                        "Retry scheduled"
                    );
                    ctx.emit(TelemetryEvent::RetryScheduled {
                        request_id: ctx.request_id().clone(),
                        from,
                        target,
                        attempt,
                        cross_stage_retries: t.state.decision.cross_stage_retries,
                    });
                    self.checkpoint(&t.state, ctx).await;
                }
                Transition::Complete => {
                    t.state.decision.last_completed = Some(from);
                    return Ok(());
                }
                Transition::Fail => {
                    let (stage, node) = match proposed {
                        Transition::Retry(target) => (target, self.budget_key(target).to_string()),
                        _ => (from, report.node),
                    };
                    let diagnostic = match exhausted {
                        Some(reason) => Some(match report.diagnostic {
                            Some(d) => format!("{}; last error: {}", reason, d),
                            None => reason.to_string(),
                        }),
                        None => report.diagnostic,
                    };
                    return Err(Halt::Failed {
                        stage,
                        node,
                        diagnostic,
                    });
                }
            }
        }
    }

    async fn run_single(
        &self,
        node: &Arc<dyn Node>,
        t: &mut Traversal,
        ctx: &RunContext,
    ) -> Result<StageReport, Halt> {
        let name = node.name().to_string();
        t.last_node = Some(name.clone());
        let attempt = t.state.attempts(&name);

        let mut result = self.invoke_node(node.as_ref(), &t.state, attempt, ctx).await?;

        if node.stage() == Stage::Reasoning
            && result.outcome == NodeOutcome::Success
            && result.delta.plan.is_none()
            && t.state.plan().is_none()
        {
            result.outcome = NodeOutcome::RetriableFailure;
            result.diagnostic = Some("reasoner reported success without a plan".into());
        }

        let NodeResult {
            delta,
            outcome,
            diagnostic,
            retry_target,
        } = result;
        self.absorb(t, &name, delta, outcome, diagnostic.as_deref());
        if outcome != NodeOutcome::Success {
            self.checkpoint(&t.state, ctx).await;
        }

        Ok(StageReport::single(
            &name,
            outcome,
            diagnostic,
            retry_target.unwrap_or_else(|| node.stage()),
        ))
    }

    /// Fan out to the selected tool nodes against one snapshot and merge
    /// each result as it settles, until all settle or the stage deadline.
    async fn run_fetch(&self, t: &mut Traversal, ctx: &RunContext) -> Result<StageReport, Halt> {
        t.last_node = Some(FETCH_STAGE_KEY.to_string());
        let (selected, mut missing) = self.select_tools(t);
        for name in &missing {
            warn!(tool = %name, "No tool node configured for required tool");
            self.absorb(
                t,
                name,
                StateDelta::new(),
                NodeOutcome::FatalFailure,
                Some("required by the intent but not configured"),
            );
        }

        let snapshot = t.state.clone();
        let stage_deadline = Instant::now() + self.limits.stage_timeout;
        let mut pending: FuturesUnordered<_> = selected
            .iter()
            .map(|node| self.fetch_one(node, &snapshot, ctx))
            .collect();

        let mut settled: HashSet<String> = HashSet::new();
        let mut rerun = Vec::new();

        loop {
            match tokio::time::timeout_at(stage_deadline, pending.next()).await {
                Ok(Some(outcome)) => {
                    let SettledTool {
                        name,
                        result,
                        retries,
                    } = outcome?;
                    if retries > 0 {
                        *t.state.decision.attempts.entry(name.clone()).or_insert(0) += retries;
                    }
                    match result.outcome {
                        NodeOutcome::Success => {}
                        NodeOutcome::RetriableFailure => {
                            missing.push(name.clone());
                            rerun.push(name.clone());
                        }
                        NodeOutcome::FatalFailure => missing.push(name.clone()),
                    }
                    self.absorb(
                        t,
                        &name,
                        result.delta,
                        result.outcome,
                        result.diagnostic.as_deref(),
                    );
                    settled.insert(name);
                    self.checkpoint(&t.state, ctx).await;
                }
                Ok(None) => break,
                Err(_) => {
                    let note = format!(
                        "timed out: stage deadline of {}ms elapsed",
                        self.limits.stage_timeout.as_millis()
                    );
                    for node in &selected {
                        let name = node.name();
                        if settled.contains(name) {
                            continue;
                        }
                        warn!(tool = %name, "Tool did not settle before the stage deadline");
                        self.absorb(t, name, StateDelta::new(), NodeOutcome::RetriableFailure, Some(&note));
                        missing.push(name.to_string());
                        rerun.push(name.to_string());
                    }
                    break;
                }
            }
        }

        let verdict = if rerun.is_empty() {
            // Permanent failures cannot be fixed by re-running; go on degraded.
            Verdict::Success
        } else {
            Verdict::Retriable {
                target: Stage::ParallelFetch,
            }
        };
        let diagnostic = (!missing.is_empty()).then(|| format!("fetch incomplete: {}", missing.join(", ")));

        Ok(StageReport {
            verdict,
            node: FETCH_STAGE_KEY.to_string(),
            diagnostic,
            missing,
            rerun,
        })
    }

    /// Invoke a tool node, retrying in place within its own budget.
    async fn fetch_one(
        &self,
        node: &Arc<dyn Node>,
        snapshot: &RunState,
        ctx: &RunContext,
    ) -> Result<SettledTool, Halt> {
        let used = snapshot.attempts(node.name());
        let budget = node.spec().max_retries.saturating_sub(used);
        let mut retries = 0;
        loop {
            let result = self.invoke_node(node.as_ref(), snapshot, used + retries, ctx).await?;
            if result.outcome == NodeOutcome::RetriableFailure && retries < budget {
                retries += 1;
                debug!(tool = %node.name(), retries, "Retrying tool in place");
                continue;
            }
            return Ok(SettledTool {
                name: node.name().to_string(),
                result,
                retries,
            });
        }
    }

    /// Run one node under its timeout, racing cancellation.
    async fn invoke_node(
        &self,
        node: &dyn Node,
        state: &RunState,
        attempt: u32,
        ctx: &RunContext,
    ) -> Result<NodeResult, Halt> {
        let stage = node.stage();
        let timeout = node.spec().timeout;
        ctx.emit(TelemetryEvent::NodeStarted {
            request_id: ctx.request_id().clone(),
            node: node.name().to_string(),
            stage,
            attempt,
        });
        debug!(node = %node.name(), stage = %stage, attempt, "Invoking node");

        let started = Instant::now();
        let result = tokio::select! {
            biased;
            _ = ctx.cancel_token().cancelled() => return Err(Halt::Cancelled),
            r = tokio::time::timeout(timeout, node.invoke(state, ctx)) => r.unwrap_or_else(|_| {
                NodeResult::retriable(format!("timed out after {}ms", timeout.as_millis()))
            }),
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        debug!(
            node = %node.name(),
            outcome = %result.outcome,
            elapsed_ms,
            "Node finished"
        );
        ctx.emit(TelemetryEvent::NodeFinished {
            request_id: ctx.request_id().clone(),
            node: node.name().to_string(),
            stage,
            outcome: result.outcome,
            elapsed_ms,
        });
        Ok(result)
    }

    /// Merge a node's delta plus executor bookkeeping into the state.
    fn absorb(
        &self,
        t: &mut Traversal,
        node: &str,
        mut delta: StateDelta,
        outcome: NodeOutcome,
        diagnostic: Option<&str>,
    ) {
        delta.trace.push(node.to_string());
        delta.last_outcome = Some(outcome);
        if let Some(diag) = diagnostic {
            delta.error_notes.push(format!("{}: {}", node, diag));
        }
        t.state = merge(&t.state, &delta, &self.limits.merge);
    }

    fn degraded_pass(&self, t: &mut Traversal, missing: &[String], ctx: &RunContext) {
        warn!(missing = ?missing, "Proceeding to reasoning with partial results");
        let delta = StateDelta::new().with_note(format!(
            "{}: degraded pass without {}",
            FETCH_STAGE_KEY,
            missing.join(", ")
        ));
        t.state = merge(&t.state, &delta, &self.limits.merge);
        ctx.emit(TelemetryEvent::DegradedPass {
            request_id: ctx.request_id().clone(),
            missing: missing.to_vec(),
        });
    }

    /// Tool nodes the current intent needs, plus required tools with no node.
    fn select_tools(&self, t: &Traversal) -> (Vec<Arc<dyn Node>>, Vec<String>) {
        let intent = t
            .state
            .working
            .classification
            .as_ref()
            .map(|c| c.intent)
            .unwrap_or_default();

        let mut unavailable = Vec::new();
        let mut selected: Vec<Arc<dyn Node>> = match intent.required_tools() {
            Some(required) => required
                .iter()
                .filter_map(|name| {
                    let node = self.tools.iter().find(|n| n.name() == *name).cloned();
                    if node.is_none() {
                        unavailable.push(name.to_string());
                    }
                    node
                })
                .collect(),
            None => self.tools.clone(),
        };

        if let Some(ref rerun) = t.rerun_tools {
            selected.retain(|n| rerun.iter().any(|r| r == n.name()));
            unavailable.clear();
        }
        (selected, unavailable)
    }

    fn budget_key(&self, stage: Stage) -> &str {
        match stage {
            Stage::Classifying => self.classifier.name(),
            Stage::ParallelFetch => FETCH_STAGE_KEY,
            Stage::Reasoning => self.reasoner.name(),
        }
    }

    fn budget(&self, state: &RunState, target: Stage) -> Budget {
        let max_retries = match target {
            Stage::Classifying => self.classifier.spec().max_retries,
            Stage::ParallelFetch => self.limits.fetch_max_retries,
            Stage::Reasoning => self.reasoner.spec().max_retries,
        };
        Budget {
            attempts: state.attempts(self.budget_key(target)),
            max_retries,
            cross_stage_retries: state.decision.cross_stage_retries,
            max_cross_stage_retries: self.limits.max_cross_stage_retries,
        }
    }

    /// Fill a missing identity from the last checkpoint of this request.
    async fn recover_identity(&self, t: &mut Traversal, ctx: &RunContext) {
        if t.state.has_user() {
            return;
        }
        let Some(store) = ctx.store() else {
            return;
        };
        match store.load(&t.state.request_id).await {
            Ok(Some(previous)) => {
                if let Some(user) = previous.user_id.filter(|u| !u.trim().is_empty()) {
                    info!(request_id = %t.state.request_id, "Recovered identity from checkpoint");
                    t.state = merge(&t.state, &StateDelta::new().with_user(user), &self.limits.merge);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Identity recovery failed"),
        }
    }

    /// Persist a snapshot. Failures are reported, never fatal.
    async fn checkpoint(&self, state: &RunState, ctx: &RunContext) {
        let Some(store) = ctx.store() else {
            return;
        };
        if let Err(e) = store.checkpoint(&state.request_id, state).await {
            warn!(request_id = %state.request_id, error = %e, "Checkpoint failed");
            ctx.emit(TelemetryEvent::CheckpointFailed {
                request_id: ctx.request_id().clone(),
                error: e.to_string(),
            });
        }
    }

    fn report(&self, halt: Halt, t: Traversal, ctx: &RunContext) -> FailureReport {
        let (kind, stage, node, last_diagnostic) = match halt {
            Halt::Failed {
                stage,
                node,
                diagnostic,
            } => (FailureKind::FatalNodeFailure, stage, Some(node), diagnostic),
            Halt::TimedOut => (
                FailureKind::TraversalTimeout,
                t.stage,
                t.last_node.clone(),
                Some(format!(
                    "traversal deadline of {}ms elapsed during {}",
                    ctx.timeout().as_millis(),
                    t.stage
                )),
            ),
            Halt::Cancelled => (
                FailureKind::Cancelled,
                t.stage,
                t.last_node.clone(),
                Some("traversal cancelled by caller".to_string()),
            ),
        };
        let attempts = t.state.attempts(self.budget_key(stage));
        let mut state = t.state;
        if kind != FailureKind::Cancelled {
            state.decision.finished = true;
        }
        FailureReport {
            kind,
            stage: Some(stage),
            node,
            last_diagnostic,
            attempts,
            state: Box::new(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use atlas_core::types::{Intent, ModelTier, RequestId, TRAFFIC_TOOL, FLIGHT_TOOL};
    use atlas_test_utils::{fixtures, MemoryStore, MockTool, RecordingTelemetry, Script, ScriptedReasoner};
    use tokio_util::sync::CancellationToken;

    use crate::graph::node::NodeSpec;

    fn executor(limits: ExecutorLimits) -> GraphExecutor {
        GraphExecutor::new(
            Arc::new(ClassifierNode::new(NodeSpec::new(3, Duration::from_secs(5)), ModelTier::Fast)),
            Arc::new(ReasonerNode::new(NodeSpec::new(3, Duration::from_secs(5)), ModelTier::Deep)),
        )
        .with_tool(Arc::new(ToolFetchNode::new(TRAFFIC_TOOL, NodeSpec::new(0, Duration::from_secs(30)))))
        .with_tool(Arc::new(ToolFetchNode::new(FLIGHT_TOOL, NodeSpec::new(0, Duration::from_secs(30)))))
        .with_limits(limits)
    }

    fn limits() -> ExecutorLimits {
        ExecutorLimits {
            max_cross_stage_retries: 3,
            stage_timeout: Duration::from_secs(10),
            fetch_max_retries: 1,
            merge: MergeLimits::default(),
        }
    }

    fn happy_reasoner(intent: &str) -> ScriptedReasoner {
        ScriptedReasoner::new()
            .then(ModelTier::Fast, Script::text(fixtures::classification_reply(intent, Some("UA123"))))
            .then(ModelTier::Deep, Script::text(fixtures::plan_reply("wait", 55.0)))
    }

    fn context(reasoner: ScriptedReasoner, traffic: MockTool, flight: MockTool) -> RunContext {
        RunContext::new(RequestId::from_str("r1"), Duration::from_secs(60))
            .with_reasoning(Arc::new(reasoner))
            .with_tool(Arc::new(traffic))
            .with_tool(Arc::new(flight))
    }

    #[tokio::test]
    async fn test_airport_trip_runs_both_tools() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let ctx = context(
            happy_reasoner("airport_trip"),
            MockTool::ok(TRAFFIC_TOOL, fixtures::traffic_payload("clear", 1200)),
            MockTool::ok(FLIGHT_TOOL, fixtures::flight_payload("UA123", "on_time", 180)),
        )
        .with_telemetry(telemetry.clone());

        let state = executor(limits())
            .run(RunState::new(RequestId::from_str("r1"), "drive to SFO for UA123"), &ctx)
            .await
            .unwrap();

        assert!(state.plan().is_some());
        assert!(state.decision.finished);
        assert_eq!(state.decision.last_completed, Some(Stage::Reasoning));
        assert_eq!(state.working.tool_results.len(), 2);
        assert_eq!(state.decision.trace.first().map(String::as_str), Some("classifier"));
        assert_eq!(state.decision.trace.last().map(String::as_str), Some("reasoner"));
        assert_eq!(telemetry.count("stage_transition"), 2);
        assert_eq!(telemetry.kinds().last().copied(), Some("traversal_completed"));
    }

    #[tokio::test]
    async fn test_classifier_retry_carries_note() {
        let reasoner = ScriptedReasoner::new()
            .then(ModelTier::Fast, Script::text("I am not sure"))
            .then(ModelTier::Fast, Script::text(fixtures::classification_reply("commute", None)))
            .then(ModelTier::Deep, Script::text(fixtures::plan_reply("wait", 40.0)));
        let ctx = context(
            reasoner,
            MockTool::ok(TRAFFIC_TOOL, fixtures::traffic_payload("moderate", 1500)),
            MockTool::ok(FLIGHT_TOOL, fixtures::flight_payload("UA1", "on_time", 200)),
        );

        let state = executor(limits())
            .run(RunState::new(RequestId::from_str("r1"), "commute home"), &ctx)
            .await
            .unwrap();
        assert_eq!(state.attempts("classifier"), 1);
        assert_eq!(state.decision.cross_stage_retries, 1);
        assert!(state.decision.error_notes[0].starts_with("classifier: "));
        assert_eq!(
            state.working.classification.as_ref().map(|c| c.intent),
            Some(Intent::Commute)
        );
        // Commute only needs traffic.
        assert!(state.tool_result(FLIGHT_TOOL).is_none());
    }

    #[tokio::test]
    async fn test_fatal_classifier_fails_fast() {
        let reasoner = ScriptedReasoner::new().then(ModelTier::Fast, Script::reject("invalid api key"));
        let ctx = context(
            reasoner,
            MockTool::ok(TRAFFIC_TOOL, fixtures::traffic_payload("clear", 600)),
            MockTool::ok(FLIGHT_TOOL, fixtures::flight_payload("UA1", "on_time", 200)),
        );
        let report = executor(limits())
            .run(RunState::new(RequestId::from_str("r1"), "q"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(report.kind, FailureKind::FatalNodeFailure);
        assert_eq!(report.stage, Some(Stage::Classifying));
        assert_eq!(report.node.as_deref(), Some("classifier"));
        assert_eq!(report.attempts, 0);
        assert!(report.last_diagnostic.unwrap().contains("invalid api key"));
    }

    #[tokio::test]
    async fn test_transient_tool_failure_reruns_only_that_tool() {
        let traffic = Arc::new(MockTool::flaky(TRAFFIC_TOOL, fixtures::traffic_payload("heavy", 2400), 1));
        let flight = Arc::new(MockTool::ok(FLIGHT_TOOL, fixtures::flight_payload("UA123", "delayed", 120)));
        let ctx = RunContext::new(RequestId::from_str("r1"), Duration::from_secs(60))
            .with_reasoning(Arc::new(happy_reasoner("airport_trip")))
            .with_tool(traffic.clone())
            .with_tool(flight.clone());

        let state = executor(limits())
            .run(RunState::new(RequestId::from_str("r1"), "q"), &ctx)
            .await
            .unwrap();
        assert_eq!(traffic.calls(), 2);
        assert_eq!(flight.calls(), 1);
        assert_eq!(state.attempts(FETCH_STAGE_KEY), 1);
        assert_eq!(state.working.tool_results.len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_fetch_takes_degraded_pass() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let ctx = context(
            happy_reasoner("airport_trip"),
            MockTool::failing(TRAFFIC_TOOL, true),
            MockTool::ok(FLIGHT_TOOL, fixtures::flight_payload("UA123", "on_time", 150)),
        )
        .with_telemetry(telemetry.clone());

        let state = executor(limits())
            .run(RunState::new(RequestId::from_str("r1"), "q"), &ctx)
            .await
            .unwrap();
        assert!(state.plan().is_some());
        assert_eq!(state.attempts(FETCH_STAGE_KEY), 1);
        assert!(state.tool_result(TRAFFIC_TOOL).is_none());
        assert_eq!(telemetry.count("degraded_pass"), 1);
        assert!(state
            .decision
            .error_notes
            .iter()
            .any(|n| n.contains("degraded pass without traffic")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_traversal_deadline() {
        let reasoner = ScriptedReasoner::new().always(ModelTier::Fast, Script::hang());
        let ctx = RunContext::new(RequestId::from_str("r1"), Duration::from_secs(2))
            .with_reasoning(Arc::new(reasoner));
        let report = executor(limits())
            .run(RunState::new(RequestId::from_str("r1"), "q"), &ctx)
            .await
            .unwrap_err();
        assert_eq!(report.kind, FailureKind::TraversalTimeout);
        assert_eq!(report.stage, Some(Stage::Classifying));
        assert!(report.state.decision.finished);
    }

    #[tokio::test(start_paused = true)]
    async fn test_node_timeout_is_retriable() {
        let reasoner = ScriptedReasoner::new()
            .then(ModelTier::Fast, Script::hang())
            .then(ModelTier::Fast, Script::text(fixtures::classification_reply("commute", None)))
            .then(ModelTier::Deep, Script::text(fixtures::plan_reply("wait", 40.0)));
        let ctx = context(
            reasoner,
            MockTool::ok(TRAFFIC_TOOL, fixtures::traffic_payload("clear", 600)),
            MockTool::ok(FLIGHT_TOOL, fixtures::flight_payload("UA1", "on_time", 200)),
        );
        let state = executor(limits())
            .run(RunState::new(RequestId::from_str("r1"), "q"), &ctx)
            .await
            .unwrap();
        assert_eq!(state.attempts("classifier"), 1);
        assert!(state.decision.error_notes[0].contains("timed out after 5000ms"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_without_checkpoint() {
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let reasoner = ScriptedReasoner::new().always(ModelTier::Fast, Script::hang());
        let ctx = RunContext::new(RequestId::from_str("r1"), Duration::from_secs(60))
            .with_reasoning(Arc::new(reasoner))
            .with_store(store.clone())
            .with_cancel(cancel.clone());

        let exec = executor(limits());
        let run = exec.run(RunState::new(RequestId::from_str("r1"), "q").with_user("u1"), &ctx);
        let canceller = async {
            tokio::task::yield_now().await;
            cancel.cancel();
        };
        let (result, ()) = tokio::join!(run, canceller);

        let report = result.unwrap_err();
        assert_eq!(report.kind, FailureKind::Cancelled);
        assert!(!report.state.decision.finished);
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_not_fatal() {
        let telemetry = Arc::new(RecordingTelemetry::new());
        let ctx = context(
            happy_reasoner("flight_departure_check"),
            MockTool::ok(TRAFFIC_TOOL, fixtures::traffic_payload("clear", 600)),
            MockTool::ok(FLIGHT_TOOL, fixtures::flight_payload("UA123", "on_time", 200)),
        )
        .with_store(Arc::new(MemoryStore::failing()))
        .with_telemetry(telemetry.clone());

        let state = executor(limits())
            .run(RunState::new(RequestId::from_str("r1"), "q"), &ctx)
            .await
            .unwrap();
        assert!(state.plan().is_some());
        assert!(telemetry.count("checkpoint_failed") > 0);
    }

    #[tokio::test]
    async fn test_resume_continues_after_last_stage() {
        let reasoner = Arc::new(
            ScriptedReasoner::new().then(ModelTier::Deep, Script::text(fixtures::plan_reply("nudge_leave_now", 10.0))),
        );
        let ctx = RunContext::new(RequestId::from_str("r1"), Duration::from_secs(60)).with_reasoning(reasoner.clone());

        let mut checkpoint = RunState::new(RequestId::from_str("r1"), "q");
        checkpoint.decision.last_completed = Some(Stage::ParallelFetch);
        let state = executor(limits()).resume(checkpoint, &ctx).await.unwrap();

        assert!(state.plan().is_some());
        assert_eq!(reasoner.calls(ModelTier::Fast), 0);
        assert_eq!(reasoner.calls(ModelTier::Deep), 1);

        // A finished checkpoint is returned untouched.
        let done = executor(limits()).resume(state.clone(), &ctx).await.unwrap();
        assert_eq!(done, state);
    }

    #[test]
    fn test_limits_from_config() {
        let limits = ExecutorLimits::from_config(&GraphConfig::default());
        assert_eq!(limits.max_cross_stage_retries, 3);
        assert_eq!(limits.merge.max_error_notes, 32);
    }
}
