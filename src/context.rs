//! The serving-process context: one instance owns every piece of shared
//! state (pending approvals, session grants, sub-agent counters, live
//! streams), so independent instances can coexist in one process.

use std::sync::{Arc, PoisonError, RwLock};

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent_loop::LoopServices;
use crate::approval::{ApprovalGate, ApprovalRequest, ApprovalScope, GateSettings, SessionPermissions};
use crate::config::WardenConfig;
use crate::error::Result;
use crate::events::{Channel, EventBus, EventKind, Subscription};
use crate::provider::ModelProvider;
use crate::safety::SafetyPolicy;
use crate::store::{ChangeLog, Store};
use crate::stream::{StreamManager, SubmitOutcome};
use crate::subagent::{RunAgentTool, SubagentLimiter, SubagentRunner};
use crate::tools::{builtin, DynamicToolProvider, ToolRegistry};

pub struct WardenContext {
    config: RwLock<WardenConfig>,
    store: Arc<dyn Store>,
    bus: Arc<EventBus>,
    registry: Arc<ToolRegistry>,
    gate: Arc<ApprovalGate>,
    limiter: Arc<SubagentLimiter>,
    subagents: Arc<SubagentRunner>,
    streams: Arc<StreamManager>,
    services: LoopServices,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for WardenContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WardenContext")
            .field("bus", &self.bus)
            .field("streams", &self.streams)
            .finish_non_exhaustive()
    }
}

impl WardenContext {
    /// Wire up a context over `store`, which also serves as the change log.
    ///
    /// Safety and sub-agent sections saved in the store replace the ones in
    /// `config`; persisted "always" grants join the allow-list.
    pub async fn open<S>(config: WardenConfig, store: Arc<S>, provider: Arc<dyn ModelProvider>) -> Result<Self>
    where
        S: Store + ChangeLog + 'static,
    {
        let log: Arc<dyn ChangeLog> = store.clone();
        let store: Arc<dyn Store> = store;

        let mut config = config;
        if let Some(saved) = store.load_config().await? {
            tracing::debug!("using saved safety and sub-agent configuration");
            config.safety = saved.safety;
            config.subagent = saved.subagent;
        }
        let config = config.normalized();

        let policy = policy_with_grants(&config, store.as_ref()).await?;
        let bus = Arc::new(EventBus::new(log, config.events.clone()).await?);
        let gate = Arc::new(ApprovalGate::new(
            policy,
            Arc::new(SessionPermissions::new()),
            bus.clone(),
            store.clone(),
            GateSettings::from_config(&config),
        ));

        let registry = Arc::new(ToolRegistry::new());
        for tool in builtin::all_tools() {
            registry.register(tool);
        }
        let limiter = Arc::new(SubagentLimiter::new(&config.subagent));
        let services = LoopServices {
            provider,
            registry: registry.clone(),
            gate: gate.clone(),
            bus: bus.clone(),
            store: store.clone(),
            limiter: limiter.clone(),
        };
        let subagents = Arc::new(SubagentRunner::new(
            services.clone(),
            config.subagent.clone(),
            config.agent.clone(),
        ));
        registry.register(RunAgentTool::shared(&subagents));
        let streams = Arc::new(StreamManager::new(
            services.clone(),
            config.agent.clone(),
            &config.events,
            config.stale_after(),
        ));

        tracing::info!(
            instance_id = %bus.instance_id(),
            mode = %config.safety.approval_mode,
            tools = registry.names().len(),
            "warden context ready"
        );
        Ok(Self {
            config: RwLock::new(config),
            store,
            bus,
            registry,
            gate,
            limiter,
            subagents,
            streams,
            services,
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the change-log poller and the stale-stream reaper.
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        vec![
            self.bus.spawn_poller(self.shutdown.child_token()),
            self.streams.spawn_reaper(self.shutdown.child_token()),
        ]
    }

    /// Stop background tasks and cancel every live stream.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        for conversation_id in self.streams.active_conversations() {
            self.streams.stop(&conversation_id);
        }
    }

    /// Send a user message to a conversation.
    pub async fn submit(&self, conversation_id: &str, text: impl Into<String>) -> Result<SubmitOutcome> {
        self.streams.submit(conversation_id, text).await
    }

    /// Answer a pending approval.
    pub async fn respond(&self, approval_id: &str, approved: bool, scope: ApprovalScope) -> Result<ApprovalRequest> {
        self.gate.respond(approval_id, approved, scope).await
    }

    pub fn subscribe(&self, channel: Channel) -> Subscription {
        self.bus.subscribe(channel)
    }

    /// Subscribe and replay everything after `after_id` (client reconnect).
    pub async fn subscribe_from(&self, channel: Channel, after_id: u64) -> Result<Subscription> {
        self.bus.subscribe_from(channel, after_id).await
    }

    pub async fn register_dynamic_tools(&self, provider: Arc<dyn DynamicToolProvider>) -> Result<Vec<String>> {
        self.registry.register_dynamic(provider).await
    }

    /// Persist new safety and sub-agent settings.
    ///
    /// The safety section (policy, approval timeout, pending limit) and the
    /// stale-stream threshold apply immediately. Sub-agent budgets apply from
    /// the next [`WardenContext::open`].
    pub async fn update_config(&self, config: WardenConfig) -> Result<()> {
        let config = config.normalized();
        self.store.save_config(&config).await?;
        let policy = policy_with_grants(&config, self.store.as_ref()).await?;
        self.gate.set_policy(policy);
        self.gate.set_settings(GateSettings::from_config(&config));
        self.streams.set_stale_after(config.stale_after());
        let database = config.events.database.clone();
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
        if let Err(e) = self
            .bus
            .publish(Channel::database(database), EventKind::ConfigChanged, json!({ "sections": ["safety", "subagent"] }))
            .await
        {
            tracing::warn!(error = %e, "failed to publish config change");
        }
        Ok(())
    }

    pub fn config(&self) -> WardenConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn gate(&self) -> &Arc<ApprovalGate> {
        &self.gate
    }

    pub fn limiter(&self) -> &Arc<SubagentLimiter> {
        &self.limiter
    }

    pub fn subagents(&self) -> &Arc<SubagentRunner> {
        &self.subagents
    }

    pub fn streams(&self) -> &Arc<StreamManager> {
        &self.streams
    }

    pub fn services(&self) -> &LoopServices {
        &self.services
    }
}

async fn policy_with_grants(config: &WardenConfig, store: &dyn Store) -> Result<SafetyPolicy> {
    let mut policy = SafetyPolicy::from_config(&config.safety)?;
    for tool in store.load_always_grants().await? {
        policy.allow(tool);
    }
    Ok(policy)
}
