//! In-memory store. One instance shared by several buses behaves like a
//! store shared by sibling processes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{ChangeLog, Store};
use crate::config::WardenConfig;
use crate::error::Result;
use crate::events::{Event, NewEvent};
use crate::types::{ModelMessage, ToolCallRecord};

#[derive(Debug, Default)]
struct Inner {
    messages: HashMap<String, Vec<ModelMessage>>,
    tool_calls: HashMap<String, Vec<ToolCallRecord>>,
    config: Option<WardenConfig>,
    always_grants: BTreeSet<String>,
    events: Vec<Event>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn append_message(&self, conversation_id: &str, message: &ModelMessage) -> Result<()> {
        self.lock()
            .messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<ModelMessage>> {
        Ok(self.lock().messages.get(conversation_id).cloned().unwrap_or_default())
    }

    async fn append_tool_call(&self, conversation_id: &str, record: &ToolCallRecord) -> Result<()> {
        self.lock()
            .tool_calls
            .entry(conversation_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn load_tool_calls(&self, conversation_id: &str) -> Result<Vec<ToolCallRecord>> {
        Ok(self.lock().tool_calls.get(conversation_id).cloned().unwrap_or_default())
    }

    async fn load_config(&self) -> Result<Option<WardenConfig>> {
        Ok(self.lock().config.clone())
    }

    async fn save_config(&self, config: &WardenConfig) -> Result<()> {
        self.lock().config = Some(config.clone());
        Ok(())
    }

    async fn load_always_grants(&self) -> Result<BTreeSet<String>> {
        Ok(self.lock().always_grants.clone())
    }

    async fn save_always_grant(&self, tool: &str) -> Result<()> {
        self.lock().always_grants.insert(tool.to_string());
        Ok(())
    }

    async fn revoke_always_grant(&self, tool: &str) -> Result<bool> {
        Ok(self.lock().always_grants.remove(tool))
    }
}

#[async_trait]
impl ChangeLog for MemoryStore {
    async fn append(&self, event: NewEvent) -> Result<Event> {
        let mut inner = self.lock();
        let id = inner.events.last().map_or(1, |last| last.id + 1);
        let event = event.into_event(id);
        inner.events.push(event.clone());
        Ok(event)
    }

    async fn read_after(&self, after_id: u64, limit: usize) -> Result<Vec<Event>> {
        let inner = self.lock();
        let start = inner.events.partition_point(|e| e.id <= after_id);
        Ok(inner.events[start..].iter().take(limit).cloned().collect())
    }

    async fn latest_id(&self) -> Result<u64> {
        Ok(self.lock().events.last().map_or(0, |e| e.id))
    }
}
