use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::warn;

use atlas_core::config::RetryConfig;
use atlas_core::error::Result;
use atlas_core::traits::ToolBackend;
use atlas_core::types::ToolQuery;

/// A tool backend that retries transient failures with exponential backoff
/// before the graph ever sees them.
pub struct RetryingTool {
    inner: Arc<dyn ToolBackend>,
    config: RetryConfig,
}

impl RetryingTool {
    pub fn new(inner: Arc<dyn ToolBackend>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl ToolBackend for RetryingTool {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn fetch(
        &self,
        query: ToolQuery,
        as_of: DateTime<Utc>,
    ) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            let max_retries = self.config.max_retries;
            let mut attempt = 0;
            loop {
                match self.inner.fetch(query.clone(), as_of).await {
                    Ok(payload) => return Ok(payload),
                    Err(e) if e.is_retryable() && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.config);
                        warn!(
                            tool = %self.inner.name(),
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying tool request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }

    fn freshness(&self) -> Duration {
        self.inner.freshness()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_test_utils::{fixtures, MockTool};

    fn config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = config(5);
        let first = calculate_backoff(0, &cfg).as_millis();
        assert!((80..=120).contains(&first));
        let capped = calculate_backoff(10, &cfg).as_millis();
        assert!((800..=1200).contains(&capped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_transient_failures() {
        let inner = Arc::new(MockTool::flaky("traffic", fixtures::traffic_payload("clear", 900), 2));
        let tool = RetryingTool::new(inner.clone(), config(2));
        let payload = tool.fetch(ToolQuery::default(), Utc::now()).await.unwrap();
        assert_eq!(payload["status"], "clear");
        assert_eq!(inner.calls(), 3);
        assert_eq!(tool.name(), "traffic");
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let inner = Arc::new(MockTool::failing("traffic", true));
        let tool = RetryingTool::new(inner.clone(), config(1));
        assert!(tool.fetch(ToolQuery::default(), Utc::now()).await.is_err());
        assert_eq!(inner.calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let inner = Arc::new(MockTool::failing("flight", false));
        let tool = RetryingTool::new(inner.clone(), config(3));
        assert!(tool.fetch(ToolQuery::default(), Utc::now()).await.is_err());
        assert_eq!(inner.calls(), 1);
    }
}
