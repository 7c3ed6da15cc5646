//! Tool fan-out for one model response.

use futures::future::join_all;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::approval::{DenialReason, ToolDecision};
use crate::error::WardenError;
use crate::tools::{validate_arguments, ToolArguments, ToolContext};
use crate::types::{AgentToolCall, AgentToolResult, ToolCallRecord, ToolCallStatus};

use super::events::{LoopEmitter, LoopEvent};
use super::runner::{LoopOptions, LoopServices};

pub(crate) struct ToolDispatch<'a> {
    pub services: &'a LoopServices,
    pub options: &'a LoopOptions,
    pub emitter: &'a LoopEmitter,
    pub root_request_id: &'a str,
}

impl ToolDispatch<'_> {
    /// Run every call concurrently. Results come back in call order,
    /// whatever order they finished in.
    pub async fn dispatch_all(&self, calls: &[AgentToolCall], cancel: &CancellationToken) -> Vec<AgentToolResult> {
        let results = join_all(calls.iter().map(|call| self.dispatch_one(call, cancel))).await;
        debug_assert!(results.iter().zip(calls).all(|(r, c)| r.tool_call_id == c.id));
        results
    }

    async fn dispatch_one(&self, call: &AgentToolCall, cancel: &CancellationToken) -> AgentToolResult {
        self.emitter
            .emit(LoopEvent::ToolCallStart {
                call: call.clone(),
                depth: self.options.depth,
            })
            .await;

        let record = self.resolve(call, cancel).await;
        let result = AgentToolResult {
            tool_call_id: call.id.clone(),
            result: record.result.clone().unwrap_or(serde_json::Value::Null),
            is_error: record.status != ToolCallStatus::Succeeded,
        };

        if let Err(e) = self
            .services
            .store
            .append_tool_call(&self.options.conversation_id, &record)
            .await
        {
            tracing::warn!(error = %e, tool = %call.name, "failed to record tool call");
        }
        self.emitter
            .emit(LoopEvent::ToolCallEnd {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                status: record.status,
                decision: record.decision,
                is_error: result.is_error,
                depth: self.options.depth,
            })
            .await;
        result
    }

    async fn resolve(&self, call: &AgentToolCall, cancel: &CancellationToken) -> ToolCallRecord {
        let Some(entry) = self.services.registry.get(&call.name) else {
            let mut record = ToolCallRecord::new(call, crate::safety::ToolTier::Execute, self.options.depth);
            record.finish(
                ToolCallStatus::Failed,
                json!({ "error": WardenError::ToolNotFound(call.name.clone()).to_string() }),
            );
            return record;
        };

        let mut record = ToolCallRecord::new(call, entry.tier, self.options.depth);
        if cancel.is_cancelled() {
            record.finish(ToolCallStatus::Canceled, json!({ "error": "cancelled before dispatch" }));
            return record;
        }

        record.status = ToolCallStatus::AwaitingApproval;
        let auth = self
            .services
            .gate
            .authorize(&self.options.conversation_id, call, entry.tier, self.options.depth, cancel)
            .await;
        record.tier = auth.tier;
        record.decision = Some(auth.decision);

        if !auth.allowed() {
            let timeout_secs = self.services.gate.timeout().as_secs();
            let (status, error) = denial(call, auth.decision, timeout_secs);
            tracing::info!(tool = %call.name, decision = ?auth.decision, "tool call not executed");
            record.finish(status, json!({ "error": error.to_string(), "decision": auth.decision }));
            return record;
        }

        let args = ToolArguments::new(call.arguments.clone());
        if let Err(rejection) = validate_arguments(&call.name, entry.tool.parameters(), args.raw()) {
            record.finish(ToolCallStatus::Failed, rejection);
            return record;
        }

        record.status = ToolCallStatus::Running;
        let ctx = ToolContext {
            conversation_id: self.options.conversation_id.clone(),
            tool_call_id: call.id.clone(),
            depth: self.options.depth,
            root_request_id: self.root_request_id.to_string(),
            cancel: cancel.child_token(),
        };
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(WardenError::Canceled),
            outcome = entry.tool.execute(&args, &ctx) => outcome,
        };
        match outcome {
            Ok(value) => record.finish(ToolCallStatus::Succeeded, value),
            Err(WardenError::Canceled) => {
                record.finish(ToolCallStatus::Canceled, json!({ "error": "cancelled" }));
            }
            Err(e) => {
                tracing::debug!(tool = %call.name, error = %e, "tool returned an error");
                record.finish(ToolCallStatus::Failed, json!({ "error": e.to_string() }));
            }
        }
        record
    }
}

fn denial(call: &AgentToolCall, decision: ToolDecision, timeout_secs: u64) -> (ToolCallStatus, WardenError) {
    let tool_name = call.name.clone();
    match decision {
        ToolDecision::HardBlocked => (ToolCallStatus::Blocked, WardenError::HardBlocked(tool_name)),
        ToolDecision::Denied {
            reason: DenialReason::TimedOut,
        } => (
            ToolCallStatus::Denied,
            WardenError::ApprovalTimeout {
                tool_name,
                timeout_secs,
            },
        ),
        ToolDecision::Denied {
            reason: DenialReason::Canceled,
        } => (ToolCallStatus::Canceled, WardenError::ApprovalDenied { tool_name }),
        _ => (ToolCallStatus::Denied, WardenError::ApprovalDenied { tool_name }),
    }
}

/// Results for calls that were never dispatched because the loop stopped.
pub(crate) fn cancelled_results(calls: &[AgentToolCall]) -> Vec<AgentToolResult> {
    calls
        .iter()
        .map(|call| AgentToolResult {
            tool_call_id: call.id.clone(),
            result: json!({ "error": "cancelled before dispatch" }),
            is_error: true,
        })
        .collect()
}
