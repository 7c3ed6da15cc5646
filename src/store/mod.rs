//! Persistence contract.
//!
//! [`Store`] covers conversation messages, the tool-call audit trail,
//! configuration and persisted "always" grants. [`ChangeLog`] is the durable
//! append-only event record that lets sibling processes see each other's
//! events. Both are implemented in memory and on SQLite.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::config::WardenConfig;
use crate::error::Result;
use crate::events::{Event, NewEvent};
use crate::types::{ModelMessage, ToolCallRecord};

#[async_trait]
pub trait Store: Send + Sync {
    async fn append_message(&self, conversation_id: &str, message: &ModelMessage) -> Result<()>;

    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<ModelMessage>>;

    /// Record a finished tool call, including its approval decision.
    async fn append_tool_call(&self, conversation_id: &str, record: &ToolCallRecord) -> Result<()>;

    async fn load_tool_calls(&self, conversation_id: &str) -> Result<Vec<ToolCallRecord>>;

    async fn load_config(&self) -> Result<Option<WardenConfig>>;

    async fn save_config(&self, config: &WardenConfig) -> Result<()>;

    async fn load_always_grants(&self) -> Result<BTreeSet<String>>;

    async fn save_always_grant(&self, tool: &str) -> Result<()>;

    /// Returns whether a grant was removed.
    async fn revoke_always_grant(&self, tool: &str) -> Result<bool>;
}

#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Append an event and return it with its assigned id. Ids increase
    /// monotonically across every writer sharing the log.
    async fn append(&self, event: NewEvent) -> Result<Event>;

    /// Events with id greater than `after_id`, oldest first, at most `limit`.
    async fn read_after(&self, after_id: u64, limit: usize) -> Result<Vec<Event>>;

    /// Highest assigned id, or 0 for an empty log.
    async fn latest_id(&self) -> Result<u64>;
}
