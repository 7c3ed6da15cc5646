//! Observable events emitted by a running loop.

use std::sync::Arc;

use serde::Serialize;

use crate::approval::ToolDecision;
use crate::events::{Channel, EventBus, EventKind};
use crate::types::{AgentToolCall, ToolCallStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoopEvent {
    Thinking {
        iteration: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    Token {
        text: String,
    },
    ToolCallStart {
        call: AgentToolCall,
        depth: usize,
    },
    ToolCallEnd {
        tool_call_id: String,
        tool_name: String,
        status: ToolCallStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        decision: Option<ToolDecision>,
        is_error: bool,
        depth: usize,
    },
    Compacted {
        before: usize,
        after: usize,
    },
    Done {
        text: String,
        iterations: usize,
    },
    Error {
        message: String,
    },
    Cancelled,
}

impl LoopEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Thinking { .. } => EventKind::Thinking,
            Self::Token { .. } => EventKind::Token,
            Self::ToolCallStart { .. } => EventKind::ToolCallStart,
            Self::ToolCallEnd { .. } => EventKind::ToolCallEnd,
            Self::Compacted { .. } => EventKind::Compacted,
            Self::Done { .. } => EventKind::Done,
            Self::Error { .. } => EventKind::Error,
            Self::Cancelled => EventKind::Cancelled,
        }
    }

    /// Events a nested loop forwards to the parent conversation.
    fn visible_when_nested(&self) -> bool {
        matches!(self, Self::ToolCallStart { .. } | Self::ToolCallEnd { .. })
    }
}

/// Publishes loop events on the conversation channel.
///
/// Nested loops only forward tool events, so observers of the parent never
/// see a child's tokens or its `done`.
#[derive(Debug, Clone)]
pub(crate) struct LoopEmitter {
    bus: Arc<EventBus>,
    channel: Channel,
    nested: bool,
}

impl LoopEmitter {
    pub(crate) fn new(bus: Arc<EventBus>, conversation_id: &str, depth: usize) -> Self {
        Self {
            bus,
            channel: Channel::conversation(conversation_id),
            nested: depth > 0,
        }
    }

    pub(crate) async fn emit(&self, event: LoopEvent) {
        if self.nested && !event.visible_when_nested() {
            return;
        }
        let kind = event.kind();
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, %kind, "failed to encode loop event");
                return;
            }
        };
        if let Err(e) = self.bus.publish(self.channel.clone(), kind, payload).await {
            tracing::warn!(error = %e, %kind, channel = %self.channel, "failed to publish loop event");
        }
    }
}
