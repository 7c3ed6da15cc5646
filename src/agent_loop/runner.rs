//! The agent loop: model calls alternating with tool execution.

use std::sync::Arc;
use std::time::Duration;

use bon::Builder;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::approval::ApprovalGate;
use crate::config::AgentConfig;
use crate::error::{Result, WardenError};
use crate::events::EventBus;
use crate::provider::{ModelProvider, ModelRequest};
use crate::store::Store;
use crate::subagent::SubagentLimiter;
use crate::tools::ToolRegistry;
use crate::types::{AgentToolCall, ModelMessage, Role, StreamEventType, Usage};
use crate::util::retry::RetryPolicy;
use crate::util::timeout::with_timeout;

use super::compaction;
use super::events::{LoopEmitter, LoopEvent};
use super::tooling::{cancelled_results, ToolDispatch};
use super::types::{LoopState, RunResult, RunStatus};

/// Hooks the owner of a run exposes to it.
pub trait LoopSession: Send + Sync {
    /// Next queued user message. Returning `None` ends the run; owners that
    /// accept messages concurrently must close their queue atomically here.
    fn next_follow_up(&self) -> Option<String>;
}

/// Shared collaborators of every loop in a serving process.
#[derive(Clone)]
pub struct LoopServices {
    pub provider: Arc<dyn ModelProvider>,
    pub registry: Arc<ToolRegistry>,
    pub gate: Arc<ApprovalGate>,
    pub bus: Arc<EventBus>,
    pub store: Arc<dyn Store>,
    pub limiter: Arc<SubagentLimiter>,
}

impl std::fmt::Debug for LoopServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopServices")
            .field("provider", &self.provider.name())
            .field("tools", &self.registry.names())
            .finish_non_exhaustive()
    }
}

/// Per-run settings.
#[derive(Debug, Clone, Builder)]
pub struct LoopOptions {
    #[builder(into)]
    pub conversation_id: String,
    /// Model calls allowed per turn.
    #[builder(default = 50)]
    pub max_iterations: usize,
    /// 0 for a top-level loop, 1+ for sub-agents.
    #[builder(default)]
    pub depth: usize,
    /// Root request a nested loop belongs to. Top-level loops start a new
    /// one every turn.
    #[builder(into)]
    pub root_request_id: Option<String>,
    #[builder(default = 100_000)]
    pub token_ceiling: usize,
    #[builder(default = 6)]
    pub min_compact_messages: usize,
    #[builder(default = Duration::from_secs(120))]
    pub stream_idle_timeout: Duration,
    #[builder(default = 3)]
    pub retry_attempts: u32,
    #[builder(into)]
    pub system_prompt: Option<String>,
    #[builder(into)]
    pub model: Option<String>,
    /// Append messages to the store as they are committed.
    #[builder(default = true)]
    pub persist: bool,
    /// Tools not advertised to the model.
    #[builder(default)]
    pub excluded_tools: Vec<String>,
}

impl LoopOptions {
    pub fn from_config(conversation_id: impl Into<String>, config: &AgentConfig) -> Self {
        Self::builder()
            .conversation_id(conversation_id)
            .max_iterations(config.max_iterations)
            .token_ceiling(config.token_ceiling)
            .min_compact_messages(config.min_compact_messages)
            .stream_idle_timeout(Duration::from_secs(config.stream_idle_timeout_secs))
            .retry_attempts(config.retry_attempts)
            .maybe_system_prompt(config.system_prompt.clone())
            .build()
    }
}

enum TurnEnd {
    Completed(String),
    Cancelled,
    Failed(WardenError),
    IterationLimit,
}

enum Streamed {
    Finished { text: String, calls: Vec<AgentToolCall> },
    Cancelled,
}

#[derive(Default)]
struct Totals {
    iterations: usize,
    tool_calls: usize,
    usage: Usage,
}

pub struct AgentLoop {
    services: LoopServices,
    options: LoopOptions,
    state: watch::Sender<LoopState>,
}

impl AgentLoop {
    pub fn new(services: LoopServices, options: LoopOptions) -> Self {
        let (state, _) = watch::channel(LoopState::AwaitingModel);
        Self {
            services,
            options,
            state,
        }
    }

    pub fn options(&self) -> &LoopOptions {
        &self.options
    }

    pub fn state(&self) -> LoopState {
        *self.state.borrow()
    }

    /// Follow state transitions while the loop runs.
    pub fn watch_state(&self) -> watch::Receiver<LoopState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LoopState) {
        self.state.send_replace(state);
    }

    /// Run until the model stops calling tools and no follow-up is queued,
    /// or until cancellation, failure or the iteration cap.
    ///
    /// History committed before the run stops is kept (and persisted when
    /// `persist` is set); the returned result carries it.
    pub async fn run(
        &self,
        history: Vec<ModelMessage>,
        cancel: &CancellationToken,
        session: Option<&dyn LoopSession>,
    ) -> RunResult {
        let emitter = LoopEmitter::new(
            self.services.bus.clone(),
            &self.options.conversation_id,
            self.options.depth,
        );
        let mut messages = history;
        let mut totals = Totals::default();
        let mut turns = 0;

        loop {
            turns += 1;
            let root_request_id = match (&self.options.root_request_id, self.options.depth) {
                (Some(root), depth) if depth > 0 => root.clone(),
                _ => Uuid::new_v4().to_string(),
            };
            tracing::debug!(
                conversation_id = %self.options.conversation_id,
                depth = self.options.depth,
                turn = turns,
                %root_request_id,
                "turn start"
            );

            let end = self
                .run_turn(&mut messages, &root_request_id, cancel, session, &emitter, &mut totals)
                .await;
            if self.options.depth == 0 {
                self.services.limiter.release_root(&root_request_id);
            }

            let (status, error) = match end {
                TurnEnd::Completed(text) => {
                    self.set_state(LoopState::Done);
                    emitter
                        .emit(LoopEvent::Done {
                            text,
                            iterations: totals.iterations,
                        })
                        .await;
                    if let Some(next) = session.and_then(|s| s.next_follow_up()) {
                        tracing::debug!(conversation_id = %self.options.conversation_id, "continuing with queued message");
                        self.set_state(LoopState::AwaitingModel);
                        self.commit(&mut messages, ModelMessage::user(next)).await;
                        continue;
                    }
                    (RunStatus::Completed, None)
                }
                TurnEnd::Cancelled => {
                    self.set_state(LoopState::Cancelled);
                    tracing::info!(conversation_id = %self.options.conversation_id, "run cancelled");
                    emitter.emit(LoopEvent::Cancelled).await;
                    (RunStatus::Cancelled, None)
                }
                TurnEnd::Failed(e) => {
                    self.set_state(LoopState::Error);
                    tracing::error!(
                        conversation_id = %self.options.conversation_id,
                        depth = self.options.depth,
                        error = %e,
                        "run failed"
                    );
                    emitter
                        .emit(LoopEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    (RunStatus::Failed, Some(e.to_string()))
                }
                TurnEnd::IterationLimit => {
                    self.set_state(LoopState::Error);
                    let message = format!(
                        "stopped after {} model calls without a final answer",
                        self.options.max_iterations
                    );
                    tracing::warn!(conversation_id = %self.options.conversation_id, "{message}");
                    emitter.emit(LoopEvent::Error { message: message.clone() }).await;
                    (RunStatus::IterationLimit, Some(message))
                }
            };

            let final_text = messages
                .iter()
                .rev()
                .find(|m| m.role == Role::Assistant)
                .map(ModelMessage::text)
                .unwrap_or_default();
            return RunResult {
                status,
                final_text,
                iterations: totals.iterations,
                turns,
                tool_calls: totals.tool_calls,
                usage: totals.usage,
                error,
                finished_at: chrono::Utc::now(),
                messages,
            };
        }
    }

    async fn run_turn(
        &self,
        messages: &mut Vec<ModelMessage>,
        root_request_id: &str,
        cancel: &CancellationToken,
        session: Option<&dyn LoopSession>,
        emitter: &LoopEmitter,
        totals: &mut Totals,
    ) -> TurnEnd {
        let mut iteration = 0;
        loop {
            if cancel.is_cancelled() {
                return TurnEnd::Cancelled;
            }
            if iteration >= self.options.max_iterations {
                return TurnEnd::IterationLimit;
            }
            iteration += 1;
            totals.iterations += 1;

            self.maybe_compact(messages, emitter).await;
            self.set_state(LoopState::Thinking);
            emitter
                .emit(LoopEvent::Thinking {
                    iteration,
                    text: None,
                })
                .await;

            let (text, calls) = match self.stream_turn(messages, iteration, cancel, emitter, totals).await {
                Ok(Streamed::Finished { text, calls }) => (text, calls),
                Ok(Streamed::Cancelled) => return TurnEnd::Cancelled,
                Err(e) => return TurnEnd::Failed(e),
            };

            if calls.is_empty() {
                self.commit(messages, ModelMessage::assistant(text.clone())).await;
                return TurnEnd::Completed(text);
            }
            self.commit(messages, ModelMessage::assistant_with_tool_calls(text, calls.clone()))
                .await;

            if cancel.is_cancelled() {
                for result in cancelled_results(&calls) {
                    self.commit(
                        messages,
                        ModelMessage::tool_result(result.tool_call_id, result.result, result.is_error),
                    )
                    .await;
                }
                return TurnEnd::Cancelled;
            }

            self.set_state(LoopState::ToolExecution);
            let dispatch = ToolDispatch {
                services: &self.services,
                options: &self.options,
                emitter,
                root_request_id,
            };
            let results = dispatch.dispatch_all(&calls, cancel).await;
            totals.tool_calls += calls.len();
            for result in results {
                self.commit(
                    messages,
                    ModelMessage::tool_result(result.tool_call_id, result.result, result.is_error),
                )
                .await;
            }
            self.set_state(LoopState::AwaitingModel);
        }
    }

    fn build_request(&self, messages: &[ModelMessage]) -> ModelRequest {
        let mut outgoing = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = &self.options.system_prompt {
            outgoing.push(ModelMessage::system(prompt.clone()));
        }
        outgoing.extend_from_slice(messages);
        let excluded: Vec<&str> = self.options.excluded_tools.iter().map(String::as_str).collect();
        ModelRequest::builder()
            .messages(outgoing)
            .tools(self.services.registry.definitions(&excluded))
            .maybe_model(self.options.model.clone())
            .build()
    }

    async fn stream_turn(
        &self,
        messages: &[ModelMessage],
        iteration: usize,
        cancel: &CancellationToken,
        emitter: &LoopEmitter,
        totals: &mut Totals,
    ) -> Result<Streamed> {
        let request = self.build_request(messages);
        let provider = &self.services.provider;
        let retry = RetryPolicy::with_max_attempts(self.options.retry_attempts);

        let idle = self.options.stream_idle_timeout;
        let request = &request;
        let open = || async move {
            with_timeout(idle, provider.stream_chat(request))
                .await
                .map_err(|e| match e {
                    WardenError::Timeout(_) => WardenError::TransientModel(format!(
                        "model stream did not open within {}s",
                        idle.as_secs()
                    )),
                    other => other,
                })
        };
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Streamed::Cancelled),
            opened = retry.execute(open) => opened,
        };
        let mut stream = opened?;

        let idle_sleep = tokio::time::sleep(idle);
        tokio::pin!(idle_sleep);

        let mut text = String::new();
        let mut calls: Vec<AgentToolCall> = Vec::new();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(Streamed::Cancelled),
                _ = &mut idle_sleep => {
                    return Err(WardenError::TransientModel(format!(
                        "model stream idle for {}s",
                        idle.as_secs()
                    )));
                }
                delta = stream.next() => {
                    let Some(delta) = delta else { break };
                    let delta = delta?;
                    idle_sleep.as_mut().reset(Instant::now() + idle);
                    match delta.event_type {
                        StreamEventType::TextDelta => {
                            if !delta.text.is_empty() {
                                text.push_str(&delta.text);
                                emitter.emit(LoopEvent::Token { text: delta.text }).await;
                            }
                        }
                        StreamEventType::Reasoning => {
                            if !delta.text.is_empty() {
                                emitter
                                    .emit(LoopEvent::Thinking {
                                        iteration,
                                        text: Some(delta.text),
                                    })
                                    .await;
                            }
                        }
                        StreamEventType::ToolCallDelta => {
                            if let Some(call) = delta.tool_call {
                                match calls.iter_mut().find(|c| c.id == call.id) {
                                    Some(existing) => *existing = call,
                                    None => calls.push(call),
                                }
                            }
                        }
                        StreamEventType::Done => {
                            if let Some(usage) = delta.usage {
                                totals.usage.input_tokens = totals.usage.input_tokens.saturating_add(usage.input_tokens);
                                totals.usage.output_tokens = totals.usage.output_tokens.saturating_add(usage.output_tokens);
                            }
                            break;
                        }
                    }
                }
            }
        }

        calls.retain(|c| !c.name.is_empty());
        tracing::debug!(
            conversation_id = %self.options.conversation_id,
            iteration,
            tool_calls = calls.len(),
            text_len = text.len(),
            "model turn complete"
        );
        Ok(Streamed::Finished { text, calls })
    }

    async fn maybe_compact(&self, messages: &mut Vec<ModelMessage>, emitter: &LoopEmitter) {
        if !compaction::needs_compaction(messages, self.options.token_ceiling) {
            return;
        }
        let before = messages.len();
        self.set_state(LoopState::Compacting);
        match compaction::compact(
            self.services.provider.as_ref(),
            messages,
            self.options.min_compact_messages,
            self.options.model.clone(),
        )
        .await
        {
            Ok(Some(summary)) => {
                *messages = vec![summary];
                tracing::info!(conversation_id = %self.options.conversation_id, before, "history compacted");
                emitter.emit(LoopEvent::Compacted { before, after: 1 }).await;
            }
            Ok(None) => {
                tracing::debug!(before, "history over ceiling but too short to compact");
            }
            Err(e) => {
                tracing::warn!(error = %e, "compaction failed; keeping full history");
            }
        }
    }

    async fn commit(&self, messages: &mut Vec<ModelMessage>, message: ModelMessage) {
        if self.options.persist {
            if let Err(e) = self
                .services
                .store
                .append_message(&self.options.conversation_id, &message)
                .await
            {
                tracing::warn!(error = %e, conversation_id = %self.options.conversation_id, "failed to persist message");
            }
        }
        messages.push(message);
    }
}
