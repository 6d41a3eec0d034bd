use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// Reasoning backend: free-text completions at a selectable tier.
pub trait ReasoningBackend: Send + Sync + 'static {
    /// Complete a prompt. Implementations should honour `request.timeout`;
    /// the executor enforces it regardless.
    fn complete(&self, request: ReasoningRequest) -> BoxFuture<'_, Result<Completion>>;
}

/// Tool backend, one per external data source.
pub trait ToolBackend: Send + Sync + 'static {
    /// Tool name (the key its results are stored under).
    fn name(&self) -> &str;

    /// Fetch a domain payload for the query as of the given instant.
    ///
    /// A backend that falls back to placeholder data should set
    /// `"degraded": true` on the returned object.
    fn fetch(&self, query: ToolQuery, as_of: DateTime<Utc>)
        -> BoxFuture<'_, Result<serde_json::Value>>;

    /// How long a fetched result stays valid.
    fn freshness(&self) -> Duration {
        Duration::from_secs(300)
    }
}

/// State store for checkpoints, for crash recovery and identity recovery.
pub trait StateStore: Send + Sync + 'static {
    /// Persist the latest snapshot for a request (replaces any previous one).
    fn checkpoint(&self, request_id: &RequestId, state: &RunState) -> BoxFuture<'_, Result<()>>;

    /// Load the latest snapshot for a request.
    fn load(&self, request_id: &RequestId) -> BoxFuture<'_, Result<Option<RunState>>>;
}

/// Telemetry sink. Must never block or fail the traversal.
pub trait TelemetryEmitter: Send + Sync + 'static {
    fn record(&self, event: TelemetryEvent);
}
