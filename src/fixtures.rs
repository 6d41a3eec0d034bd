use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tracing::{debug, warn};

use atlas_core::config::{AppConfig, ToolConfig};
use atlas_core::error::{AtlasError, Result};
use atlas_core::traits::{ReasoningBackend, ToolBackend};
use atlas_core::types::{Completion, ModelTier, ReasoningRequest, ToolQuery};

/// Replays recorded model replies from a fixture directory.
///
/// `classifier.txt` answers the classifier's tier and `reasoner.txt` the
/// reasoner's, so the two nodes must be configured on different tiers.
pub struct FixtureReasoner {
    replies: HashMap<ModelTier, String>,
}

impl FixtureReasoner {
    pub fn load(dir: &Path, config: &AppConfig) -> Result<Self> {
        if config.classifier.tier == config.reasoner.tier {
            return Err(AtlasError::Config(
                "fixture replay needs the classifier and reasoner on different tiers".into(),
            ));
        }
        let mut replies = HashMap::new();
        for (tier, file) in [
            (config.classifier.tier, "classifier.txt"),
            (config.reasoner.tier, "reasoner.txt"),
        ] {
            let path = dir.join(file);
            match std::fs::read_to_string(&path) {
                Ok(text) => {
                    replies.insert(tier, text);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Missing reasoning fixture"),
            }
        }
        Ok(Self { replies })
    }
}

impl ReasoningBackend for FixtureReasoner {
    fn complete(&self, request: ReasoningRequest) -> BoxFuture<'_, Result<Completion>> {
        Box::pin(async move {
            debug!(tier = ?request.tier, corrections = request.corrections.len(), "Replaying fixture reply");
            match self.replies.get(&request.tier) {
                Some(text) => Ok(Completion::text(text.clone())),
                None => Err(AtlasError::ReasoningRejected(format!(
                    "no fixture reply for {:?} tier",
                    request.tier
                ))),
            }
        })
    }
}

/// Serves `<tool>.json` from a fixture directory as the tool's payload.
pub struct FixtureTool {
    name: String,
    path: PathBuf,
    freshness: Duration,
}

impl FixtureTool {
    pub fn new(dir: &Path, config: &ToolConfig) -> Self {
        Self {
            name: config.name.clone(),
            path: dir.join(format!("{}.json", config.name)),
            freshness: config.ttl(),
        }
    }
}

impl ToolBackend for FixtureTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn fetch(&self, query: ToolQuery, _as_of: DateTime<Utc>) -> BoxFuture<'_, Result<serde_json::Value>> {
        Box::pin(async move {
            debug!(tool = %self.name, query = ?query, "Replaying fixture payload");
            let content = tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|e| AtlasError::ToolExecution {
                    tool: self.name.clone(),
                    message: format!("{}: {}", self.path.display(), e),
                    transient: false,
                })?;
            Ok(serde_json::from_str(&content)?)
        })
    }

    fn freshness(&self) -> Duration {
        self.freshness
    }
}
