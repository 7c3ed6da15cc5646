//! Tool trait and closure-based tool wrapper.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::arguments::ToolArguments;
use super::types::ToolParameters;
use crate::error::WardenError;
use crate::safety::ToolTier;

/// Context available during tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolContext {
    pub conversation_id: String,
    pub tool_call_id: String,
    /// Nesting depth of the loop issuing the call (0 = top level).
    pub depth: usize,
    /// Identifies the top-level request this call belongs to.
    pub root_request_id: String,
    /// Cancelled when the owning loop stops; long-running tools should watch it.
    pub cancel: CancellationToken,
}

/// Core tool trait. Implement to create custom tools.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must match what the model calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema parameters.
    fn parameters(&self) -> &ToolParameters;

    /// Statically known risk tier. `None` lets the registry fall back to the
    /// built-in table and then to `Execute`.
    fn tier(&self) -> Option<ToolTier> {
        None
    }

    /// Execute the tool with parsed arguments.
    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, WardenError>;
}

/// Type alias for the tool handler function.
type ToolHandler = dyn Fn(
        ToolArguments,
        ToolContext,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, WardenError>> + Send>>
    + Send
    + Sync;

/// Closure-based tool for quick tool creation.
pub struct AgentTool {
    name: String,
    description: String,
    parameters: ToolParameters,
    tier: Option<ToolTier>,
    handler: Arc<ToolHandler>,
}

impl AgentTool {
    /// Create a tool from a closure.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: ToolParameters,
        handler: F,
    ) -> Self
    where
        F: Fn(ToolArguments, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, WardenError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            tier: None,
            handler: Arc::new(move |args, ctx| Box::pin(handler(args, ctx))),
        }
    }

    /// Declare the tool's risk tier.
    pub fn with_tier(mut self, tier: ToolTier) -> Self {
        self.tier = Some(tier);
        self
    }
}

#[async_trait]
impl Tool for AgentTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.parameters
    }

    fn tier(&self) -> Option<ToolTier> {
        self.tier
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, WardenError> {
        (self.handler)(args.clone(), ctx.clone()).await
    }
}

impl std::fmt::Debug for AgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentTool")
            .field("name", &self.name)
            .field("tier", &self.tier)
            .finish()
    }
}
