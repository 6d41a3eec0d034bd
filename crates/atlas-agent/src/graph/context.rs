use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use atlas_core::error::{AtlasError, Result};
use atlas_core::event::EventBus;
use atlas_core::traits::{ReasoningBackend, StateStore, TelemetryEmitter, ToolBackend};
use atlas_core::types::{RequestId, TelemetryEvent};

/// Per-request handles shared by every node of one traversal.
///
/// Cloning is cheap; all collaborators are behind `Arc`.
#[derive(Clone)]
pub struct RunContext {
    request_id: RequestId,
    timeout: Duration,
    cancel: CancellationToken,
    reasoning: Option<Arc<dyn ReasoningBackend>>,
    tools: HashMap<String, Arc<dyn ToolBackend>>,
    store: Option<Arc<dyn StateStore>>,
    telemetry: Arc<dyn TelemetryEmitter>,
}

impl RunContext {
    /// Create a context with the whole-traversal timeout.
    /// Telemetry defaults to an event bus nobody listens to.
    pub fn new(request_id: RequestId, timeout: Duration) -> Self {
        Self {
            request_id,
            timeout,
            cancel: CancellationToken::new(),
            reasoning: None,
            tools: HashMap::new(),
            store: None,
            telemetry: Arc::new(EventBus::new(16)),
        }
    }

    pub fn with_reasoning(mut self, backend: Arc<dyn ReasoningBackend>) -> Self {
        self.reasoning = Some(backend);
        self
    }

    /// Register a tool backend under its own name.
    pub fn with_tool(mut self, backend: Arc<dyn ToolBackend>) -> Self {
        self.tools.insert(backend.name().to_string(), backend);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryEmitter>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn reasoning(&self) -> Result<&Arc<dyn ReasoningBackend>> {
        self.reasoning
            .as_ref()
            .ok_or_else(|| AtlasError::Config("no reasoning backend configured".into()))
    }

    pub fn tool(&self, name: &str) -> Result<&Arc<dyn ToolBackend>> {
        self.tools
            .get(name)
            .ok_or_else(|| AtlasError::ToolNotFound(name.to_string()))
    }

    pub fn store(&self) -> Option<&Arc<dyn StateStore>> {
        self.store.as_ref()
    }

    pub fn emit(&self, event: TelemetryEvent) {
        self.telemetry.record(event);
    }
}
