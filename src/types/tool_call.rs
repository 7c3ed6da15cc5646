//! Lifecycle record for a single tool call.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::approval::ToolDecision;
use crate::safety::ToolTier;

/// Execution status of a tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    AwaitingApproval,
    Running,
    Succeeded,
    Failed,
    Denied,
    Blocked,
    Canceled,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending | Self::AwaitingApproval | Self::Running)
    }
}

/// A tool call as requested by the model, with its decision and outcome.
///
/// Created when the model emits the call and terminal once its result has
/// been folded back into history. Persisted for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub tier: ToolTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ToolDecision>,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Nesting depth of the loop that issued the call.
    pub depth: usize,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl ToolCallRecord {
    pub fn new(call: &super::AgentToolCall, tier: ToolTier, depth: usize) -> Self {
        Self {
            id: call.id.clone(),
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            tier,
            decision: None,
            status: ToolCallStatus::Pending,
            result: None,
            depth,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Record the final outcome.
    pub fn finish(&mut self, status: ToolCallStatus, result: serde_json::Value) {
        self.status = status;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
    }
}
