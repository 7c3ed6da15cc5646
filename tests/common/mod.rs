//! Shared test helpers and a scripted model provider.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::sync::Semaphore;

use warden::config::WardenConfig;
use warden::error::WardenError;
use warden::provider::{DeltaStream, ModelProvider, ModelRequest};
use warden::store::MemoryStore;
use warden::types::{AgentToolCall, ModelDelta, Usage};
use warden::WardenContext;

/// One scripted model response.
pub enum Step {
    /// Stream these deltas, then finish.
    Reply(Vec<ModelDelta>),
    /// Fail to open the stream with a non-retryable error.
    Fail(String),
    /// Fail to open the stream with a retryable error.
    Transient(String),
    /// Never open the stream.
    Hang,
}

impl Step {
    pub fn text(text: &str) -> Self {
        Self::Reply(vec![ModelDelta::text(text), ModelDelta::done(Some(usage()))])
    }

    pub fn tool_calls(calls: &[(&str, &str, serde_json::Value)]) -> Self {
        let mut deltas: Vec<ModelDelta> = calls
            .iter()
            .map(|(id, name, args)| ModelDelta::tool_call(call(id, name, args.clone())))
            .collect();
        deltas.push(ModelDelta::done(Some(usage())));
        Self::Reply(deltas)
    }
}

pub fn call(id: &str, name: &str, arguments: serde_json::Value) -> AgentToolCall {
    AgentToolCall {
        id: id.to_string(),
        name: name.to_string(),
        arguments,
    }
}

fn usage() -> Usage {
    Usage {
        input_tokens: 10,
        output_tokens: 5,
    }
}

/// A provider that plays back queued steps, then answers `fallback`.
///
/// With a gate installed every `stream_chat` waits for one permit first.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Step>>,
    fallback: String,
    summary: String,
    gate: Option<Arc<Semaphore>>,
    started: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedProvider {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            script: Mutex::new(steps.into()),
            fallback: "done".to_string(),
            summary: "summary of earlier work".to_string(),
            gate: None,
            started: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, text: &str) -> Self {
        self.fallback = text.to_string();
        self
    }

    pub fn with_gate(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Number of `stream_chat` calls that got past the gate.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream_chat(&self, request: &ModelRequest) -> Result<DeltaStream, WardenError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }
        self.started.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let step = self.script.lock().unwrap().pop_front();
        let deltas = match step {
            Some(Step::Reply(deltas)) => deltas,
            Some(Step::Fail(message)) => return Err(WardenError::PermanentModel(message)),
            Some(Step::Transient(message)) => return Err(WardenError::TransientModel(message)),
            Some(Step::Hang) => return std::future::pending().await,
            None => vec![ModelDelta::text(self.fallback.clone()), ModelDelta::done(None)],
        };
        Ok(Box::pin(stream::iter(deltas.into_iter().map(Ok))))
    }

    async fn complete(&self, _request: &ModelRequest) -> Result<String, WardenError> {
        Ok(self.summary.clone())
    }
}

pub async fn context(config: WardenConfig, provider: Arc<ScriptedProvider>) -> WardenContext {
    WardenContext::open(config, Arc::new(MemoryStore::new()), provider)
        .await
        .unwrap()
}

/// Poll `condition` every 10ms until it holds or five seconds pass.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
