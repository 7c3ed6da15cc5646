//! Run-level types for the agent loop.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ModelMessage, Usage};

/// Where a loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LoopState {
    AwaitingModel,
    Thinking,
    ToolExecution,
    Compacting,
    Done,
    Cancelled,
    Error,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
    Failed,
    /// The per-turn iteration cap was hit before the model stopped calling tools.
    IterationLimit,
}

/// Result of [`AgentLoop::run`](super::AgentLoop::run).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub status: RunStatus,
    /// Text of the last assistant message.
    pub final_text: String,
    /// Model calls made across all turns.
    pub iterations: usize,
    /// Turns processed, including chained follow-ups.
    pub turns: usize,
    /// Tool calls dispatched across all turns.
    pub tool_calls: usize,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
    /// History as it stood when the run ended.
    #[serde(skip)]
    pub messages: Vec<ModelMessage>,
}

impl RunResult {
    /// A run that failed before its first model call.
    pub fn failed_before_start(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            final_text: String::new(),
            iterations: 0,
            turns: 0,
            tool_calls: 0,
            usage: Usage::default(),
            error: Some(error.into()),
            finished_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}
