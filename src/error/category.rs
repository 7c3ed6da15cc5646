//! Error classification.

/// Broad error category for routing recovery logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Authentication,
    RateLimit,
    Network,
    Timeout,
    Server,
    Api,
    Configuration,
    Serialization,
    Storage,
    ToolExecution,
    Approval,
    Subagent,
    Capacity,
    Unknown,
}
