use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use atlas_core::traits::TelemetryEmitter;
use atlas_core::types::TelemetryEvent;

/// Aggregate counters over every traversal it observes.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    requests_total: AtomicU64,
    requests_success: AtomicU64,
    requests_failed: AtomicU64,
    retries: AtomicU64,
    degraded_passes: AtomicU64,
    checkpoint_failures: AtomicU64,
    tokens_used: AtomicU64,
    total_latency_ms: AtomicU64,
    last_latency_ms: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub retries: u64,
    pub degraded_passes: u64,
    pub checkpoint_failures: u64,
    pub tokens_used: u64,
    pub avg_latency_ms: u64,
    pub last_latency_ms: u64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let finished = self.requests_success.load(Ordering::Relaxed)
            + self.requests_failed.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ms.load(Ordering::Relaxed);
        MetricsSnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success: self.requests_success.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            degraded_passes: self.degraded_passes.load(Ordering::Relaxed),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
            tokens_used: self.tokens_used.load(Ordering::Relaxed),
            avg_latency_ms: total_latency.checked_div(finished).unwrap_or(0),
            last_latency_ms: self.last_latency_ms.load(Ordering::Relaxed),
        }
    }

    fn finish(&self, elapsed_ms: u64) {
        self.total_latency_ms.fetch_add(elapsed_ms, Ordering::Relaxed);
        self.last_latency_ms.store(elapsed_ms, Ordering::Relaxed);
    }
}

impl TelemetryEmitter for MetricsCollector {
    fn record(&self, event: TelemetryEvent) {
        match event {
            TelemetryEvent::TraversalStarted { .. } => {
                self.requests_total.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::TraversalCompleted { elapsed_ms, .. } => {
                self.requests_success.fetch_add(1, Ordering::Relaxed);
                self.finish(elapsed_ms);
            }
            TelemetryEvent::TraversalFailed { elapsed_ms, .. } => {
                self.requests_failed.fetch_add(1, Ordering::Relaxed);
                self.finish(elapsed_ms);
            }
            TelemetryEvent::RetryScheduled { .. } => {
                self.retries.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::DegradedPass { .. } => {
                self.degraded_passes.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::CheckpointFailed { .. } => {
                self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
            }
            TelemetryEvent::TokensUsed { tokens, .. } => {
                self.tokens_used.fetch_add(tokens, Ordering::Relaxed);
            }
            TelemetryEvent::NodeStarted { .. }
            | TelemetryEvent::NodeFinished { .. }
            | TelemetryEvent::StageTransition { .. } => {}
        }
    }
}

/// Forwards every event to several sinks.
#[derive(Default)]
pub struct TelemetryFanout {
    sinks: Vec<Arc<dyn TelemetryEmitter>>,
}

impl TelemetryFanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn TelemetryEmitter>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl TelemetryEmitter for TelemetryFanout {
    fn record(&self, event: TelemetryEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}
