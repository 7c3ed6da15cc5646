//! Approval gate: turns a `RequireApproval` classification into a
//! suspend/resume exchange with a human observer.

pub mod gate;
pub mod permissions;

pub use gate::{ApprovalGate, Authorization, GateSettings};
pub use permissions::SessionPermissions;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::safety::ToolTier;

/// How long a granted approval lasts.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ApprovalScope {
    /// This call only.
    #[default]
    Once,
    /// This tool for the rest of the process run.
    Session,
    /// Like `Session`, and persisted for future runs.
    Always,
}

/// State of an [`ApprovalRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ApprovalResolution {
    Pending,
    Approved,
    Denied,
    TimedOut,
}

/// Why a call that needed approval was not allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DenialReason {
    /// A human declined.
    Declined,
    /// Nobody answered before the deadline.
    TimedOut,
    /// No observer was attached to receive the request.
    NoApprovalChannel,
    /// Too many requests were already waiting.
    QueueFull,
    /// The owning loop was cancelled or its session reclaimed while waiting.
    Canceled,
}

/// Final approval decision for one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ToolDecision {
    AutoAllowed,
    Approved { scope: ApprovalScope },
    Denied { reason: DenialReason },
    HardBlocked,
}

impl ToolDecision {
    pub fn allows_execution(&self) -> bool {
        matches!(self, Self::AutoAllowed | Self::Approved { .. })
    }
}

/// A pending question to a human observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub conversation_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub tier: ToolTier,
    /// Command string or target path shown to the human.
    pub subject: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub resolution: ApprovalResolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ApprovalScope>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn only_auto_allowed_and_approved_execute() {
        assert!(ToolDecision::AutoAllowed.allows_execution());
        assert!(ToolDecision::Approved {
            scope: ApprovalScope::Once
        }
        .allows_execution());
        assert!(!ToolDecision::HardBlocked.allows_execution());
        assert!(!ToolDecision::Denied {
            reason: DenialReason::TimedOut
        }
        .allows_execution());
    }

    #[test]
    fn decision_serializes_with_tag() {
        let value = serde_json::to_value(ToolDecision::Denied {
            reason: DenialReason::NoApprovalChannel,
        })
        .unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "decision": "denied", "reason": "no_approval_channel" })
        );
        assert_eq!(ApprovalScope::from_str("Session").unwrap(), ApprovalScope::Session);
    }
}
