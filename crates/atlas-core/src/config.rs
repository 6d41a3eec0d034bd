use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AtlasError, Result};
use crate::types::{ModelTier, FLIGHT_TOOL, TRAFFIC_TOOL};

/// Top-level Atlas configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default = "default_classifier")]
    pub classifier: NodeConfig,
    #[serde(default = "default_reasoner")]
    pub reasoner: NodeConfig,
    #[serde(default = "default_tools")]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub store: Option<StoreConfig>,
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub fixtures: Option<FixturesConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            graph: GraphConfig::default(),
            classifier: default_classifier(),
            reasoner: default_reasoner(),
            tools: default_tools(),
            store: None,
            log: None,
            fixtures: None,
        }
    }
}

/// Traversal-wide limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Retry transitions allowed across the whole traversal.
    #[serde(default = "default_max_cross_stage_retries")]
    pub max_cross_stage_retries: u32,
    #[serde(default = "default_traversal_timeout")]
    pub traversal_timeout_secs: u64,
    /// Deadline for the parallel fetch stage to settle.
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_max_error_notes")]
    pub max_error_notes: usize,
    /// Re-runs of the fetch stage before a degraded pass.
    #[serde(default = "default_fetch_max_retries")]
    pub fetch_max_retries: u32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_cross_stage_retries: default_max_cross_stage_retries(),
            traversal_timeout_secs: default_traversal_timeout(),
            stage_timeout_secs: default_stage_timeout(),
            max_error_notes: default_max_error_notes(),
            fetch_max_retries: default_fetch_max_retries(),
        }
    }
}

impl GraphConfig {
    pub fn traversal_timeout(&self) -> Duration {
        Duration::from_secs(self.traversal_timeout_secs)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }
}

fn default_max_cross_stage_retries() -> u32 { 3 }
fn default_traversal_timeout() -> u64 { 60 }
fn default_stage_timeout() -> u64 { 20 }
fn default_max_error_notes() -> usize { 32 }
fn default_fetch_max_retries() -> u32 { 1 }

/// Per-node budget for the classifier and reasoner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_node_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub tier: ModelTier,
    /// Extra instructions appended to the built-in system prompt.
    #[serde(default)]
    pub instructions: Option<String>,
}

impl NodeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_node_max_retries() -> u32 { 3 }
fn default_node_timeout() -> u64 { 30 }

fn default_classifier() -> NodeConfig {
    NodeConfig {
        max_retries: default_node_max_retries(),
        timeout_secs: 15,
        tier: ModelTier::Fast,
        instructions: None,
    }
}

fn default_reasoner() -> NodeConfig {
    NodeConfig {
        max_retries: default_node_max_retries(),
        timeout_secs: default_node_timeout(),
        tier: ModelTier::Deep,
        instructions: None,
    }
}

/// One tool node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    /// Validity window of a fetched result.
    #[serde(default = "default_tool_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,
    /// Node-level retries; backend-level retry is configured by `retry`.
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl ToolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl_secs: default_tool_ttl(),
            timeout_secs: default_tool_timeout(),
            max_retries: 0,
            retry: None,
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_tool_ttl() -> u64 { 300 }
fn default_tool_timeout() -> u64 { 10 }

fn default_tools() -> Vec<ToolConfig> {
    vec![ToolConfig::new(TRAFFIC_TOOL), ToolConfig::new(FLIGHT_TOOL)]
}

/// Backoff for backend-level tool retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 2 }
fn default_initial_backoff() -> u64 { 200 }
fn default_max_backoff() -> u64 { 5000 }

/// Checkpoint store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    /// How long terminal checkpoints are kept before eviction.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            retention_secs: default_retention(),
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        expand_home(&self.path)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

fn default_store_path() -> String { "~/.atlas/checkpoints.db".to_string() }
fn default_retention() -> u64 { 86_400 }

/// JSONL telemetry logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ~/.atlas/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = traversal summary, 2 = stages and retries, 3 = every node.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl LogConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(self.log_dir.as_deref().unwrap_or("~/.atlas/logs"))
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// Replay fixtures used by the CLI in place of live backends.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturesConfig {
    pub dir: String,
}

impl FixturesConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        expand_home(&self.dir)
    }
}

impl AppConfig {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| AtlasError::ConfigNotFound(path.display().to_string()))?;

        Self::parse(&content)
    }

    /// Parse config from TOML text, expanding `${ENV_VAR}` references.
    pub fn parse(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: AppConfig =
            toml::from_str(&expanded).map_err(|e| AtlasError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that would make every traversal fail.
    pub fn validate(&self) -> Result<()> {
        if self.graph.traversal_timeout_secs == 0 {
            return Err(AtlasError::Config("graph.traversal_timeout_secs must be > 0".into()));
        }
        if self.graph.stage_timeout_secs == 0 {
            return Err(AtlasError::Config("graph.stage_timeout_secs must be > 0".into()));
        }
        if self.graph.max_error_notes == 0 {
            return Err(AtlasError::Config("graph.max_error_notes must be > 0".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(AtlasError::Config("tool name must not be empty".into()));
            }
            if !seen.insert(tool.name.as_str()) {
                return Err(AtlasError::Config(format!("duplicate tool: {}", tool.name)));
            }
        }
        Ok(())
    }

    pub fn tool(&self, name: &str) -> Option<&ToolConfig> {
        self.tools.iter().find(|t| t.name == name)
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
