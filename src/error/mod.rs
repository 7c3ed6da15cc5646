//! Error types for Warden.

pub mod category;

pub use category::ErrorCategory;

use thiserror::Error;

/// Primary error type for all Warden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Model API error (transient): {0}")]
    TransientModel(String),

    #[error("Model API error: {0}")]
    PermanentModel(String),

    #[error("Model API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Tool execution error: {tool_name}: {message}")]
    ToolExecution { tool_name: String, message: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Approval denied for {tool_name}")]
    ApprovalDenied { tool_name: String },

    #[error("Approval for {tool_name} timed out after {timeout_secs}s")]
    ApprovalTimeout { tool_name: String, timeout_secs: u64 },

    #[error("Tool {0} is blocked by policy")]
    HardBlocked(String),

    #[error("Sub-agent limit exceeded: {0}")]
    SubagentLimitExceeded(String),

    #[error("Sub-agent timed out after {0}s")]
    SubagentTimeout(u64),

    #[error("{queue} is full (capacity {capacity})")]
    QueueFull { queue: &'static str, capacity: usize },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Operation canceled")]
    Canceled,
}

impl WardenError {
    /// Create an API error from an HTTP status and body.
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Shorthand for a tool handler failure.
    pub fn tool(tool_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool_name: tool_name.into(),
            message: message.into(),
        }
    }

    /// Classify this error into a category.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Network(_) | Self::TransientModel(_) => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Serialization(_) => ErrorCategory::Serialization,
            Self::Storage(_) | Self::Io(_) => ErrorCategory::Storage,
            Self::PermanentModel(_) => ErrorCategory::Api,
            Self::Api { status, .. } => match status {
                401 | 403 => ErrorCategory::Authentication,
                408 => ErrorCategory::Timeout,
                429 => ErrorCategory::RateLimit,
                500..=599 => ErrorCategory::Server,
                _ => ErrorCategory::Api,
            },
            Self::ToolExecution { .. } | Self::ToolNotFound(_) | Self::InvalidArgument(_) => {
                ErrorCategory::ToolExecution
            }
            Self::ApprovalDenied { .. } | Self::ApprovalTimeout { .. } | Self::HardBlocked(_) => {
                ErrorCategory::Approval
            }
            Self::SubagentLimitExceeded(_) | Self::SubagentTimeout(_) => ErrorCategory::Subagent,
            Self::QueueFull { .. } => ErrorCategory::Capacity,
            _ => ErrorCategory::Unknown,
        }
    }

    /// Whether this error is potentially retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::RateLimit
                | ErrorCategory::Network
                | ErrorCategory::Timeout
                | ErrorCategory::Server
        )
    }
}

/// Convenience alias.
pub type Result<T> = std::result::Result<T, WardenError>;
