//! Streaming types.

use serde::{Deserialize, Serialize};

use super::message::AgentToolCall;

/// A delta emitted by a model stream.
///
/// Tool-call deltas carry the provider's best snapshot of the call so far;
/// consumers replace earlier snapshots with the same id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDelta {
    pub event_type: StreamEventType,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<AgentToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ModelDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            event_type: StreamEventType::TextDelta,
            text: text.into(),
            tool_call: None,
            usage: None,
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            event_type: StreamEventType::Reasoning,
            text: text.into(),
            tool_call: None,
            usage: None,
        }
    }

    pub fn tool_call(call: AgentToolCall) -> Self {
        Self {
            event_type: StreamEventType::ToolCallDelta,
            text: String::new(),
            tool_call: Some(call),
            usage: None,
        }
    }

    pub fn done(usage: Option<Usage>) -> Self {
        Self {
            event_type: StreamEventType::Done,
            text: String::new(),
            tool_call: None,
            usage,
        }
    }
}

/// Type of stream event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamEventType {
    /// Incremental answer text.
    TextDelta,
    /// Incremental reasoning text.
    Reasoning,
    /// Tool call being built.
    ToolCallDelta,
    /// Stream finished.
    Done,
}

/// Token usage reported by the provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
