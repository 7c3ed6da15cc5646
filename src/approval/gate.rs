//! The approval gate.
//!
//! [`ApprovalGate::authorize`] classifies a call and, when approval is
//! required, publishes an `approval_required` event on the conversation
//! channel and suspends until [`ApprovalGate::respond`] is called, the
//! deadline passes, or the owning loop is cancelled. Every path that is not
//! an explicit approval denies the call.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    ApprovalRequest, ApprovalResolution, ApprovalScope, DenialReason, SessionPermissions,
    ToolDecision,
};
use crate::config::WardenConfig;
use crate::error::{Result, WardenError};
use crate::events::{Channel, EventBus, EventKind};
use crate::safety::{Classification, PatternMatch, SafetyPolicy, ToolTier};
use crate::store::Store;
use crate::types::AgentToolCall;
use crate::util::text::truncate_chars;
use crate::util::timeout::{race, Race};

const SUBJECT_MAX_CHARS: usize = 200;

/// Gate limits taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct GateSettings {
    pub timeout: Duration,
    pub max_pending: usize,
    /// Whether sub-agents (depth > 0) may use tools granted for the session.
    pub inherit_session_grants: bool,
}

impl GateSettings {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self {
            timeout: config.safety.approval_timeout(),
            max_pending: config.safety.max_pending_approvals,
            inherit_session_grants: config.subagent.inherit_session_grants,
        }
    }
}

/// Outcome of [`ApprovalGate::authorize`].
#[derive(Debug, Clone, PartialEq)]
pub struct Authorization {
    pub tier: ToolTier,
    pub decision: ToolDecision,
    pub pattern: Option<PatternMatch>,
    /// Set when a human was asked.
    pub approval_id: Option<String>,
}

impl Authorization {
    pub fn allowed(&self) -> bool {
        self.decision.allows_execution()
    }
}

#[derive(Debug, Clone, Copy)]
enum Reply {
    Approved(ApprovalScope),
    Declined,
    Canceled,
}

struct PendingApproval {
    request: ApprovalRequest,
    responder: oneshot::Sender<Reply>,
}

pub struct ApprovalGate {
    policy: RwLock<Arc<SafetyPolicy>>,
    permissions: Arc<SessionPermissions>,
    pending: Mutex<HashMap<String, PendingApproval>>,
    bus: Arc<EventBus>,
    store: Arc<dyn Store>,
    settings: RwLock<GateSettings>,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("settings", &self.settings())
            .field("pending", &self.pending_table().len())
            .finish_non_exhaustive()
    }
}

impl ApprovalGate {
    pub fn new(
        policy: SafetyPolicy,
        permissions: Arc<SessionPermissions>,
        bus: Arc<EventBus>,
        store: Arc<dyn Store>,
        settings: GateSettings,
    ) -> Self {
        Self {
            policy: RwLock::new(Arc::new(policy)),
            permissions,
            pending: Mutex::new(HashMap::new()),
            bus,
            store,
            settings: RwLock::new(settings),
        }
    }

    fn pending_table(&self) -> MutexGuard<'_, HashMap<String, PendingApproval>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the active policy.
    pub fn policy(&self) -> Arc<SafetyPolicy> {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new policy. Calls already waiting keep the old one.
    pub fn set_policy(&self, policy: SafetyPolicy) {
        *self.policy.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(policy);
    }

    pub fn settings(&self) -> GateSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swap in new limits. Requests already waiting keep their deadline.
    pub fn set_settings(&self, settings: GateSettings) {
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings;
    }

    /// How long a request waits for an answer.
    pub fn timeout(&self) -> Duration {
        self.settings().timeout
    }

    pub fn permissions(&self) -> &Arc<SessionPermissions> {
        &self.permissions
    }

    /// Decide whether `call` may run, asking a human when needed.
    ///
    /// Never fails: anything that prevents a clean approval (no observer,
    /// full queue, timeout, cancellation) comes back as a denial.
    pub async fn authorize(
        &self,
        conversation_id: &str,
        call: &AgentToolCall,
        registered_tier: ToolTier,
        depth: usize,
        cancel: &CancellationToken,
    ) -> Authorization {
        let policy = self.policy();
        let tier = policy.effective_tier(&call.name, registered_tier);
        let session_granted = (depth == 0 || self.settings().inherit_session_grants)
            && self.permissions.contains(&call.name);
        let verdict = policy.evaluate(&call.name, tier, &call.arguments, session_granted);

        let decision = match verdict.classification {
            Classification::HardDeny => {
                tracing::warn!(tool = %call.name, conversation_id, "tool call blocked by deny-list");
                ToolDecision::HardBlocked
            }
            Classification::AutoAllow => ToolDecision::AutoAllowed,
            Classification::RequireApproval => {
                let subject = verdict
                    .pattern
                    .as_ref()
                    .map(|hit| hit.subject.clone())
                    .unwrap_or_else(|| describe_arguments(&call.arguments));
                let (approval_id, decision) = self
                    .ask(conversation_id, call, tier, subject, verdict.reason(), cancel)
                    .await;
                return Authorization {
                    tier,
                    decision,
                    pattern: verdict.pattern,
                    approval_id,
                };
            }
        };

        Authorization {
            tier,
            decision,
            pattern: verdict.pattern,
            approval_id: None,
        }
    }

    async fn ask(
        &self,
        conversation_id: &str,
        call: &AgentToolCall,
        tier: ToolTier,
        subject: String,
        reason: String,
        cancel: &CancellationToken,
    ) -> (Option<String>, ToolDecision) {
        let settings = self.settings();
        let channel = Channel::conversation(conversation_id);
        if self.bus.subscriber_count(&channel) == 0 {
            tracing::warn!(
                tool = %call.name,
                conversation_id,
                "approval required but no observer is attached; denying"
            );
            return (
                None,
                ToolDecision::Denied {
                    reason: DenialReason::NoApprovalChannel,
                },
            );
        }

        let now = Utc::now();
        let request = ApprovalRequest {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            tier,
            subject,
            reason,
            created_at: now,
            deadline: now
                + chrono::Duration::from_std(settings.timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(120)),
            resolution: ApprovalResolution::Pending,
            scope: None,
        };
        let id = request.id.clone();

        let (tx, mut rx) = oneshot::channel();
        {
            let mut pending = self.pending_table();
            if pending.len() >= settings.max_pending {
                tracing::warn!(
                    tool = %call.name,
                    capacity = settings.max_pending,
                    "approval queue full; denying"
                );
                return (
                    Some(id),
                    ToolDecision::Denied {
                        reason: DenialReason::QueueFull,
                    },
                );
            }
            pending.insert(
                id.clone(),
                PendingApproval {
                    request: request.clone(),
                    responder: tx,
                },
            );
        }

        let payload = serde_json::to_value(&request).unwrap_or_else(|_| json!({ "id": id }));
        if let Err(e) = self
            .bus
            .publish(channel.clone(), EventKind::ApprovalRequired, payload)
            .await
        {
            tracing::error!(error = %e, approval_id = %id, "failed to publish approval request");
            self.pending_table().remove(&id);
            return (
                Some(id),
                ToolDecision::Denied {
                    reason: DenialReason::NoApprovalChannel,
                },
            );
        }
        tracing::info!(approval_id = %id, tool = %call.name, conversation_id, "awaiting approval");

        let wait = cancel.child_token();
        let reply = match race(settings.timeout, &wait, &mut rx).await {
            Race::Completed(Ok(reply)) => Ok(reply),
            Race::Completed(Err(_)) => Ok(Reply::Canceled),
            Race::TimedOut => Err(ApprovalResolution::TimedOut),
            Race::Canceled => Err(ApprovalResolution::Denied),
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(resolution) => {
                // A responder may have taken the entry just as we gave up.
                let still_pending = self.pending_table().remove(&id).is_some();
                if still_pending {
                    match resolution {
                        ApprovalResolution::TimedOut => {
                            tracing::warn!(approval_id = %id, tool = %call.name, "approval timed out");
                            self.publish_resolution(&channel, &id, &call.name, ApprovalResolution::TimedOut, None)
                                .await;
                            return (
                                Some(id),
                                ToolDecision::Denied {
                                    reason: DenialReason::TimedOut,
                                },
                            );
                        }
                        _ => Reply::Canceled,
                    }
                } else {
                    rx.try_recv().unwrap_or(Reply::Canceled)
                }
            }
        };

        let decision = match reply {
            Reply::Approved(scope) => {
                self.publish_resolution(&channel, &id, &call.name, ApprovalResolution::Approved, Some(scope))
                    .await;
                ToolDecision::Approved { scope }
            }
            Reply::Declined => {
                self.publish_resolution(&channel, &id, &call.name, ApprovalResolution::Denied, None)
                    .await;
                ToolDecision::Denied {
                    reason: DenialReason::Declined,
                }
            }
            Reply::Canceled => {
                self.publish_resolution(&channel, &id, &call.name, ApprovalResolution::Denied, None)
                    .await;
                ToolDecision::Denied {
                    reason: DenialReason::Canceled,
                }
            }
        };
        (Some(id), decision)
    }

    async fn publish_resolution(
        &self,
        channel: &Channel,
        id: &str,
        tool: &str,
        resolution: ApprovalResolution,
        scope: Option<ApprovalScope>,
    ) {
        let payload = json!({
            "id": id,
            "tool_name": tool,
            "resolution": resolution,
            "scope": scope,
        });
        if let Err(e) = self
            .bus
            .publish(channel.clone(), EventKind::ApprovalResolved, payload)
            .await
        {
            tracing::warn!(error = %e, approval_id = id, "failed to publish approval resolution");
        }
    }

    /// Answer a pending request.
    ///
    /// Exactly one response wins; later responses for the same id (including
    /// ones that arrive after a timeout) get [`WardenError::NotFound`].
    pub async fn respond(&self, id: &str, approved: bool, scope: ApprovalScope) -> Result<ApprovalRequest> {
        let mut request = {
            let mut pending = self.pending_table();
            let entry = pending
                .remove(id)
                .ok_or_else(|| WardenError::NotFound(format!("approval request {id}")))?;
            let reply = if approved {
                Reply::Approved(scope)
            } else {
                Reply::Declined
            };
            if entry.responder.send(reply).is_err() {
                tracing::debug!(approval_id = id, "approval waiter already gone");
            }
            entry.request
        };

        if approved {
            request.resolution = ApprovalResolution::Approved;
            request.scope = Some(scope);
            match scope {
                ApprovalScope::Once => {}
                ApprovalScope::Session => self.permissions.grant(&request.tool_name),
                ApprovalScope::Always => {
                    self.permissions.grant(&request.tool_name);
                    {
                        let mut policy = self.policy.write().unwrap_or_else(PoisonError::into_inner);
                        Arc::make_mut(&mut *policy).allow(&request.tool_name);
                    }
                    if let Err(e) = self.store.save_always_grant(&request.tool_name).await {
                        tracing::error!(error = %e, tool = %request.tool_name, "failed to persist always grant");
                    }
                }
            }
        } else {
            request.resolution = ApprovalResolution::Denied;
        }
        tracing::info!(approval_id = id, tool = %request.tool_name, approved, %scope, "approval answered");
        Ok(request)
    }

    /// Requests still waiting for an answer, oldest first.
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut requests: Vec<_> = self
            .pending_table()
            .values()
            .map(|p| p.request.clone())
            .collect();
        requests.sort_by_key(|r| r.created_at);
        requests
    }

    pub fn pending_for(&self, conversation_id: &str) -> Vec<ApprovalRequest> {
        self.pending()
            .into_iter()
            .filter(|r| r.conversation_id == conversation_id)
            .collect()
    }

    /// Deny every pending request of a conversation. Used when a session is
    /// stopped or reclaimed. Returns how many were denied.
    pub fn deny_conversation(&self, conversation_id: &str) -> usize {
        let mut pending = self.pending_table();
        let ids: Vec<String> = pending
            .iter()
            .filter(|(_, p)| p.request.conversation_id == conversation_id)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &ids {
            if let Some(entry) = pending.remove(id) {
                let _ = entry.responder.send(Reply::Canceled);
            }
        }
        ids.len()
    }
}

/// Short text shown to the human when no pattern named the subject.
fn describe_arguments(arguments: &serde_json::Value) -> String {
    for key in ["command", "path", "file_path", "prompt"] {
        if let Some(value) = arguments.get(key).and_then(|v| v.as_str()) {
            return truncate_chars(value, SUBJECT_MAX_CHARS);
        }
    }
    truncate_chars(&arguments.to_string(), SUBJECT_MAX_CHARS)
}
