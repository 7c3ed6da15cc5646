//! Event bus: channel-keyed pub/sub with an in-process fast path and a
//! change-log path for sibling processes sharing one store.

pub mod bus;
pub mod subscription;

pub use bus::EventBus;
pub use subscription::Subscription;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WardenError;

/// Delivery channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Channel {
    /// Everything about one conversation's agent execution.
    Conversation(String),
    /// Broadcast notices for one logical database/tenant.
    Database(String),
}

impl Channel {
    pub fn conversation(id: impl Into<String>) -> Self {
        Self::Conversation(id.into())
    }

    pub fn database(name: impl Into<String>) -> Self {
        Self::Database(name.into())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conversation(id) => write!(f, "conversation:{id}"),
            Self::Database(name) => write!(f, "database:{name}"),
        }
    }
}

impl FromStr for Channel {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some(("conversation", id)) if !id.is_empty() => Ok(Self::Conversation(id.to_string())),
            Some(("database", name)) if !name.is_empty() => Ok(Self::Database(name.to_string())),
            _ => Err(WardenError::InvalidArgument(format!("unknown channel '{s}'"))),
        }
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

impl TryFrom<String> for Channel {
    type Error = WardenError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Kind of an event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    Thinking,
    Token,
    ToolCallStart,
    ToolCallEnd,
    Done,
    Error,
    Cancelled,
    Compacted,
    ApprovalRequired,
    ApprovalResolved,
    SubagentStarted,
    SubagentFinished,
    MessageQueued,
    StreamStarted,
    StreamFinished,
    ConversationUpdated,
    ConfigChanged,
}

/// An event before the change log assigns its id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub channel: Channel,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    /// Bus instance that published it.
    pub origin: Uuid,
}

/// A published event. Ids are assigned by the change log and increase monotonically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub channel: Channel,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub origin: Uuid,
    pub created_at: DateTime<Utc>,
}

impl NewEvent {
    /// Attach an id and timestamp.
    pub fn into_event(self, id: u64) -> Event {
        Event {
            id,
            channel: self.channel,
            kind: self.kind,
            payload: self.payload,
            origin: self.origin,
            created_at: Utc::now(),
        }
    }
}
