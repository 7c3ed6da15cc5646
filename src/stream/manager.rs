//! Stream sessions: one live agent loop per conversation, the prompt queue
//! behind it, and reclamation of sessions that outlived their deadline.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent_loop::{AgentLoop, LoopOptions, LoopServices, LoopSession, RunResult};
use crate::config::{AgentConfig, EventsConfig};
use crate::error::{Result, WardenError};
use crate::events::{Channel, EventKind};
use crate::types::ModelMessage;

/// What happened to a submitted message.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// A new loop started for the conversation.
    Started {
        session_id: String,
        handle: JoinHandle<RunResult>,
    },
    /// A loop is already live; the message waits at `position` (1-based).
    Queued { position: usize },
}

#[derive(Debug)]
struct SessionState {
    session_id: String,
    cancel: CancellationToken,
    started_at: Instant,
    /// Start of the turn in progress; reset when a queued message is taken.
    turn_started: Instant,
    queue: VecDeque<String>,
}

/// Owns every live stream session of a serving process.
///
/// A session is stale when its client disconnected or when its current turn
/// has been running for `stale_after` (approval timeout plus a buffer). A
/// stale session is cancelled and replaced by the next submission.
pub struct StreamManager {
    services: LoopServices,
    agent: AgentConfig,
    database: String,
    stale_after: RwLock<Duration>,
    sessions: Mutex<HashMap<String, SessionState>>,
}

impl std::fmt::Debug for StreamManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamManager")
            .field("stale_after", &self.stale_after())
            .field("active", &self.active_conversations())
            .finish_non_exhaustive()
    }
}

impl StreamManager {
    pub fn new(services: LoopServices, agent: AgentConfig, events: &EventsConfig, stale_after: Duration) -> Self {
        Self {
            services,
            agent,
            database: events.database.clone(),
            stale_after: RwLock::new(stale_after),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn stale_after(&self) -> Duration {
        *self.stale_after.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Change the stale threshold; applies to sessions already running.
    pub fn set_stale_after(&self, stale_after: Duration) {
        *self.stale_after.write().unwrap_or_else(PoisonError::into_inner) = stale_after;
    }

    fn is_stale(&self, session: &SessionState, now: Instant) -> bool {
        now.duration_since(session.turn_started) >= self.stale_after()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, SessionState>> {
        self.sessions.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("stream session table lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    /// Start a loop for `text`, or queue it behind the live one.
    ///
    /// A stale live session is reclaimed first. A full queue rejects the
    /// message with [`WardenError::QueueFull`].
    pub async fn submit(self: &Arc<Self>, conversation_id: &str, text: impl Into<String>) -> Result<SubmitOutcome> {
        let text = text.into();
        let now = Instant::now();
        let capacity = self.agent.queue_capacity;

        let (queued_at, reclaimed, started) = {
            let mut sessions = self.sessions();
            let stale = sessions.get(conversation_id).map(|s| self.is_stale(s, now));
            match stale {
                Some(false) => {
                    let Some(session) = sessions.get_mut(conversation_id) else {
                        return Err(WardenError::InvalidState("stream session vanished".into()));
                    };
                    if session.queue.len() >= capacity {
                        return Err(WardenError::QueueFull {
                            queue: "prompt queue",
                            capacity,
                        });
                    }
                    session.queue.push_back(text.clone());
                    (Some(session.queue.len()), None, None)
                }
                other => {
                    let reclaimed = if other == Some(true) {
                        sessions.remove(conversation_id)
                    } else {
                        None
                    };
                    let session_id = Uuid::new_v4().to_string();
                    let cancel = CancellationToken::new();
                    sessions.insert(
                        conversation_id.to_string(),
                        SessionState {
                            session_id: session_id.clone(),
                            cancel: cancel.clone(),
                            started_at: now,
                            turn_started: now,
                            queue: VecDeque::new(),
                        },
                    );
                    (None, reclaimed, Some((session_id, cancel)))
                }
            }
        };

        if let Some(position) = queued_at {
            tracing::debug!(conversation_id, position, "message queued behind live stream");
            self.publish(
                Channel::conversation(conversation_id),
                EventKind::MessageQueued,
                json!({ "position": position }),
            )
            .await;
            return Ok(SubmitOutcome::Queued { position });
        }
        if let Some(old) = reclaimed {
            self.reclaim(conversation_id, old, "stale");
        }
        let Some((session_id, cancel)) = started else {
            return Err(WardenError::InvalidState("stream session was not started".into()));
        };

        let manager = Arc::clone(self);
        let conversation = conversation_id.to_string();
        let task_session = session_id.clone();
        let handle = tokio::spawn(async move { manager.drive(conversation, task_session, text, cancel).await });
        Ok(SubmitOutcome::Started { session_id, handle })
    }

    async fn drive(&self, conversation_id: String, session_id: String, text: String, cancel: CancellationToken) -> RunResult {
        let channel = Channel::conversation(&conversation_id);
        self.publish(channel.clone(), EventKind::StreamStarted, json!({ "session_id": session_id }))
            .await;

        let result = match self.prepare_history(&conversation_id, text).await {
            Ok(history) => {
                let agent_loop = AgentLoop::new(
                    self.services.clone(),
                    LoopOptions::from_config(conversation_id.clone(), &self.agent),
                );
                let follow_ups = SessionFollowUps {
                    manager: self,
                    conversation_id: &conversation_id,
                    session_id: &session_id,
                };
                agent_loop.run(history, &cancel, Some(&follow_ups)).await
            }
            Err(e) => {
                tracing::error!(conversation_id = %conversation_id, error = %e, "could not load conversation history");
                RunResult::failed_before_start(e.to_string())
            }
        };

        self.release(&conversation_id, &session_id);
        self.publish(
            channel,
            EventKind::StreamFinished,
            json!({
                "session_id": session_id,
                "status": result.status,
                "iterations": result.iterations,
                "turns": result.turns,
            }),
        )
        .await;
        self.publish(
            Channel::database(&self.database),
            EventKind::ConversationUpdated,
            json!({ "conversation_id": conversation_id }),
        )
        .await;
        result
    }

    async fn prepare_history(&self, conversation_id: &str, text: String) -> Result<Vec<ModelMessage>> {
        let mut history = self.services.store.load_messages(conversation_id).await?;
        let message = ModelMessage::user(text);
        self.services.store.append_message(conversation_id, &message).await?;
        history.push(message);
        Ok(history)
    }

    /// Pop the next queued message, or close the session when none is left.
    fn take_follow_up(&self, conversation_id: &str, session_id: &str) -> Option<String> {
        let mut sessions = self.sessions();
        let session = sessions.get_mut(conversation_id).filter(|s| s.session_id == session_id)?;
        match session.queue.pop_front() {
            Some(next) => {
                session.turn_started = Instant::now();
                Some(next)
            }
            None => {
                sessions.remove(conversation_id);
                None
            }
        }
    }

    fn release(&self, conversation_id: &str, session_id: &str) {
        let mut sessions = self.sessions();
        if sessions.get(conversation_id).is_some_and(|s| s.session_id == session_id) {
            if let Some(session) = sessions.remove(conversation_id) {
                if !session.queue.is_empty() {
                    tracing::warn!(
                        conversation_id,
                        dropped = session.queue.len(),
                        "run ended early; queued messages dropped"
                    );
                }
            }
        }
    }

    fn reclaim(&self, conversation_id: &str, session: SessionState, reason: &str) {
        session.cancel.cancel();
        let denied = self.services.gate.deny_conversation(conversation_id);
        tracing::warn!(
            conversation_id,
            session_id = %session.session_id,
            reason,
            age_secs = session.started_at.elapsed().as_secs(),
            dropped = session.queue.len(),
            denied_approvals = denied,
            "stream session reclaimed"
        );
    }

    /// Cancel the live loop for a conversation and drop its queue.
    pub fn stop(&self, conversation_id: &str) -> bool {
        let removed = self.sessions().remove(conversation_id);
        match removed {
            Some(session) => {
                self.reclaim(conversation_id, session, "stopped");
                true
            }
            None => false,
        }
    }

    /// The owning client went away; the session is stale immediately.
    pub fn client_disconnected(&self, conversation_id: &str) -> bool {
        let removed = self.sessions().remove(conversation_id);
        match removed {
            Some(session) => {
                self.reclaim(conversation_id, session, "client disconnected");
                true
            }
            None => false,
        }
    }

    /// Reclaim every session whose current turn is older than `stale_after`.
    pub fn sweep_stale(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<(String, SessionState)> = {
            let mut sessions = self.sessions();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| self.is_stale(s, now))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|s| (id, s)))
                .collect()
        };
        let count = stale.len();
        for (conversation_id, session) in stale {
            self.reclaim(&conversation_id, session, "stale");
        }
        count
    }

    /// Sweep for stale sessions every `stale_after / 2` until `shutdown`.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = (self.stale_after() / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let reclaimed = manager.sweep_stale();
                        if reclaimed > 0 {
                            tracing::info!(reclaimed, "stale stream sweep");
                        }
                    }
                }
            }
        })
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.sessions().contains_key(conversation_id)
    }

    pub fn queued_len(&self, conversation_id: &str) -> usize {
        self.sessions().get(conversation_id).map_or(0, |s| s.queue.len())
    }

    pub fn active_conversations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn publish(&self, channel: Channel, kind: EventKind, payload: serde_json::Value) {
        if let Err(e) = self.services.bus.publish(channel, kind, payload).await {
            tracing::warn!(error = %e, %kind, "failed to publish stream event");
        }
    }
}

struct SessionFollowUps<'a> {
    manager: &'a StreamManager,
    conversation_id: &'a str,
    session_id: &'a str,
}

impl LoopSession for SessionFollowUps<'_> {
    fn next_follow_up(&self) -> Option<String> {
        self.manager.take_follow_up(self.conversation_id, self.session_id)
    }
}
