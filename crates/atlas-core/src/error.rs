use thiserror::Error;

#[derive(Debug, Error)]
pub enum AtlasError {
    // Reasoning backend errors
    #[error("Reasoning request failed: {0}")]
    ReasoningRequest(String),

    #[error("Reasoning backend rejected request: {0}")]
    ReasoningRejected(String),

    #[error("Reasoning timeout after {timeout_ms}ms")]
    ReasoningTimeout { timeout_ms: u64 },

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution {
        tool: String,
        message: String,
        transient: bool,
    },

    #[error("Tool timeout after {timeout_ms}ms: {tool}")]
    ToolTimeout { tool: String, timeout_ms: u64 },

    // Recovery errors
    #[error(transparent)]
    Parse(#[from] ParseFailure),

    /// Reserved for conflicting writes to non-monotonic fields. The merge
    /// policy currently resolves every conflict, so nothing raises this.
    #[error("Merge conflict on field: {field}")]
    MergeConflict { field: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AtlasError {
    /// Whether retrying the same call has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            AtlasError::ReasoningRequest(msg) => {
                msg.contains("429")
                    || msg.contains("500")
                    || msg.contains("502")
                    || msg.contains("503")
                    || msg.contains("timeout")
                    || msg.contains("connection")
            }
            AtlasError::ReasoningTimeout { .. } => true,
            AtlasError::ToolTimeout { .. } => true,
            AtlasError::ToolExecution { transient, .. } => *transient,
            AtlasError::Parse(_) => true,
            _ => false,
        }
    }
}

/// Structured output could not be extracted from a free-text response.
///
/// Carries the raw text so the caller can surface it or feed it back into a
/// self-correction prompt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Could not recover structured output: {reason}")]
pub struct ParseFailure {
    pub raw: String,
    pub reason: String,
}

impl ParseFailure {
    pub fn new(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, AtlasError>;
