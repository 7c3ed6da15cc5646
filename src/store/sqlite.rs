//! SQLite-backed store and change log.
//!
//! Several serving processes may open the same database file; WAL mode and a
//! busy timeout let them share it, and `AUTOINCREMENT` keeps change-log ids
//! monotonic across all of them.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{ChangeLog, Store};
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::events::{Channel, Event, EventKind, NewEvent};
use crate::types::{ModelMessage, ToolCallRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, id);

CREATE TABLE IF NOT EXISTS tool_calls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_id TEXT NOT NULL,
    call_id TEXT NOT NULL,
    tool_name TEXT NOT NULL,
    status TEXT NOT NULL,
    record TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tool_calls_conversation ON tool_calls(conversation_id, id);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS always_grants (
    tool_name TEXT PRIMARY KEY,
    granted_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS change_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    origin TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

const CONFIG_KEY: &str = "config";

/// Statements run on the blocking pool; the connection is shared behind a
/// mutex so one process never issues two statements at once.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open (or create) a database file and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::with_connection(conn)
    }

    /// Private in-memory database, mostly for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `work` against the connection on a blocking thread.
    async fn blocking<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(PoisonError::into_inner);
            work(&conn)
        })
        .await
        .map_err(|e| WardenError::InvalidState(format!("storage task failed: {e}")))?
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| WardenError::InvalidState(format!("bad timestamp '{raw}': {e}")))
}

fn to_sql_id(id: u64) -> i64 {
    i64::try_from(id).unwrap_or(i64::MAX)
}

fn json_column<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    conversation_id: &str,
) -> Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([conversation_id], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.iter()
        .map(|raw| serde_json::from_str(raw).map_err(WardenError::from))
        .collect()
}

#[async_trait]
impl Store for SqliteStore {
    async fn append_message(&self, conversation_id: &str, message: &ModelMessage) -> Result<()> {
        let content = serde_json::to_string(message)?;
        let role = message.role.to_string();
        let conversation_id = conversation_id.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO messages (conversation_id, role, content, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![conversation_id, role, content, now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_messages(&self, conversation_id: &str) -> Result<Vec<ModelMessage>> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |conn| {
            json_column(
                conn,
                "SELECT content FROM messages WHERE conversation_id = ?1 ORDER BY id",
                &conversation_id,
            )
        })
        .await
    }

    async fn append_tool_call(&self, conversation_id: &str, record: &ToolCallRecord) -> Result<()> {
        let encoded = serde_json::to_string(record)?;
        let conversation_id = conversation_id.to_string();
        let call_id = record.id.clone();
        let tool_name = record.tool_name.clone();
        let status = record.status.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO tool_calls (conversation_id, call_id, tool_name, status, record, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![conversation_id, call_id, tool_name, status, encoded, now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_tool_calls(&self, conversation_id: &str) -> Result<Vec<ToolCallRecord>> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |conn| {
            json_column(
                conn,
                "SELECT record FROM tool_calls WHERE conversation_id = ?1 ORDER BY id",
                &conversation_id,
            )
        })
        .await
    }

    async fn load_config(&self) -> Result<Option<WardenConfig>> {
        let raw: Option<String> = self
            .blocking(|conn| {
                Ok(conn
                    .query_row(
                        "SELECT value FROM settings WHERE key = ?1",
                        [CONFIG_KEY],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str::<WardenConfig>(&raw)?.normalized())),
            None => Ok(None),
        }
    }

    async fn save_config(&self, config: &WardenConfig) -> Result<()> {
        let raw = serde_json::to_string(config)?;
        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![CONFIG_KEY, raw, now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn load_always_grants(&self) -> Result<BTreeSet<String>> {
        self.blocking(|conn| {
            let mut stmt = conn.prepare("SELECT tool_name FROM always_grants")?;
            let grants = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<BTreeSet<_>>>()?;
            Ok(grants)
        })
        .await
    }

    async fn save_always_grant(&self, tool: &str) -> Result<()> {
        let tool = tool.to_string();
        self.blocking(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO always_grants (tool_name, granted_at) VALUES (?1, ?2)",
                params![tool, now()],
            )?;
            Ok(())
        })
        .await
    }

    async fn revoke_always_grant(&self, tool: &str) -> Result<bool> {
        let tool = tool.to_string();
        self.blocking(move |conn| {
            let removed = conn.execute("DELETE FROM always_grants WHERE tool_name = ?1", [tool])?;
            Ok(removed > 0)
        })
        .await
    }
}

type EventRow = (i64, String, String, String, String, String);

fn event_from_row(row: EventRow) -> Result<Event> {
    let (id, channel, kind, payload, origin, created_at) = row;
    Ok(Event {
        id: u64::try_from(id).map_err(|_| WardenError::InvalidState(format!("negative event id {id}")))?,
        channel: channel.parse::<Channel>()?,
        kind: kind
            .parse::<EventKind>()
            .map_err(|_| WardenError::InvalidState(format!("unknown event kind '{kind}'")))?,
        payload: serde_json::from_str(&payload)?,
        origin: Uuid::parse_str(&origin)
            .map_err(|e| WardenError::InvalidState(format!("bad event origin '{origin}': {e}")))?,
        created_at: parse_timestamp(&created_at)?,
    })
}

#[async_trait]
impl ChangeLog for SqliteStore {
    async fn append(&self, event: NewEvent) -> Result<Event> {
        let payload = serde_json::to_string(&event.payload)?;
        let row = (
            event.channel.to_string(),
            event.kind.to_string(),
            event.origin.to_string(),
        );
        let id = self
            .blocking(move |conn| {
                let (channel, kind, origin) = row;
                conn.execute(
                    "INSERT INTO change_log (channel, kind, payload, origin, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![channel, kind, payload, origin, now()],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        let id = u64::try_from(id)
            .map_err(|_| WardenError::InvalidState(format!("negative event id {id}")))?;
        Ok(event.into_event(id))
    }

    async fn read_after(&self, after_id: u64, limit: usize) -> Result<Vec<Event>> {
        let rows = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, channel, kind, payload, origin, created_at
                     FROM change_log WHERE id > ?1 ORDER BY id LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(params![to_sql_id(after_id), to_sql_id(limit as u64)], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<EventRow>>>()?;
                Ok(rows)
            })
            .await?;
        rows.into_iter().map(event_from_row).collect()
    }

    async fn latest_id(&self) -> Result<u64> {
        let id: Option<i64> = self
            .blocking(|conn| Ok(conn.query_row("SELECT MAX(id) FROM change_log", [], |row| row.get(0))?))
            .await?;
        Ok(id.and_then(|id| u64::try_from(id).ok()).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ToolDecision;
    use crate::safety::ToolTier;
    use crate::types::{AgentToolCall, ToolCallStatus};
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn messages_round_trip_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.append_message("c1", &ModelMessage::user("hi")).await.unwrap();
        store.append_message("c1", &ModelMessage::assistant("hello")).await.unwrap();
        store.append_message("c2", &ModelMessage::user("other")).await.unwrap();

        let texts: Vec<String> = store
            .load_messages("c1")
            .await
            .unwrap()
            .iter()
            .map(ModelMessage::text)
            .collect();
        assert_eq!(texts, vec!["hi".to_string(), "hello".to_string()]);
    }

    #[tokio::test]
    async fn tool_call_audit_keeps_decision() {
        let store = SqliteStore::open_in_memory().unwrap();
        let call = AgentToolCall {
            id: "call_1".into(),
            name: "delete_file".into(),
            arguments: serde_json::json!({ "path": "x" }),
        };
        let mut record = ToolCallRecord::new(&call, ToolTier::Destructive, 0);
        record.decision = Some(ToolDecision::HardBlocked);
        record.finish(ToolCallStatus::Blocked, serde_json::json!({ "error": "blocked" }));
        store.append_tool_call("c1", &record).await.unwrap();

        let loaded = store.load_tool_calls("c1").await.unwrap();
        assert_eq!(loaded, vec![record]);
    }

    #[tokio::test]
    async fn config_and_grants_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("warden.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            let mut config = WardenConfig::default();
            config.subagent.max_depth = 2;
            store.save_config(&config).await.unwrap();
            store.save_always_grant("write_file").await.unwrap();
            store.save_always_grant("write_file").await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_config().await.unwrap().unwrap().subagent.max_depth, 2);
        assert_eq!(
            store.load_always_grants().await.unwrap(),
            BTreeSet::from(["write_file".to_string()])
        );
    }

    #[tokio::test]
    async fn two_handles_share_one_monotonic_change_log() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("shared.db");
        let first = SqliteStore::open(&path).unwrap();
        let second = SqliteStore::open(&path).unwrap();
        let event = |origin| NewEvent {
            channel: Channel::conversation("c"),
            kind: EventKind::Token,
            payload: serde_json::json!({ "text": "x" }),
            origin,
        };

        let a = first.append(event(Uuid::new_v4())).await.unwrap();
        let b = second.append(event(Uuid::new_v4())).await.unwrap();
        let c = first.append(event(Uuid::new_v4())).await.unwrap();
        assert!(a.id < b.id && b.id < c.id);

        let seen = second.read_after(a.id, 10).await.unwrap();
        assert_eq!(seen.iter().map(|e| e.id).collect::<Vec<_>>(), vec![b.id, c.id]);
        assert_eq!(seen[0].channel, Channel::conversation("c"));
        assert_eq!(first.latest_id().await.unwrap(), c.id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_writers_on_worker_threads_keep_every_row() {
        let store = std::sync::Arc::new(SqliteStore::open_in_memory().unwrap());
        let writers: Vec<_> = (0..8)
            .map(|n| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .append_message("c1", &ModelMessage::user(format!("m{n}")))
                        .await
                })
            })
            .collect();
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        assert_eq!(store.load_messages("c1").await.unwrap().len(), 8);
    }
}
