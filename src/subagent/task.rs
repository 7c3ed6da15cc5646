//! Bookkeeping for one sub-agent run.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SubagentStatus {
    Waiting,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// A nested agent execution spawned by `run_agent`.
///
/// `error` is the detailed diagnostic; it is logged and never handed to the
/// parent model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentTask {
    pub id: String,
    /// Tool call in the parent loop that spawned this task.
    pub parent_id: String,
    pub root_request_id: String,
    pub depth: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt: String,
    pub status: SubagentStatus,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub tool_calls: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubagentTask {
    pub fn new(parent_id: &str, root_request_id: &str, depth: usize, prompt: String, model: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: parent_id.to_string(),
            root_request_id: root_request_id.to_string(),
            depth,
            model,
            prompt,
            status: SubagentStatus::Waiting,
            started_at: Utc::now(),
            elapsed_ms: 0,
            tool_calls: 0,
            output: None,
            error: None,
        }
    }

    pub fn finish(&mut self, status: SubagentStatus, elapsed: Duration) {
        self.status = status;
        self.elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    }
}
