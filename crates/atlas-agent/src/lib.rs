pub mod checkpoint;
pub mod graph;
pub mod healing;
pub mod metrics;
pub mod nodes;
pub mod prompt;
pub mod recovery;
pub mod retry;
pub mod run_log;

pub use checkpoint::{CheckpointSummary, SqliteStateStore};
pub use graph::{
    ExecutorLimits, GraphExecutor, MergeLimits, Node, NodeResult, NodeSpec, RunContext, FETCH_STAGE_KEY,
};
pub use metrics::{MetricsCollector, MetricsSnapshot, TelemetryFanout};
pub use nodes::{ClassifierNode, ReasonerNode, ToolFetchNode};
pub use recovery::{recover, OutputSchema};
pub use retry::RetryingTool;
pub use run_log::RunLogger;
