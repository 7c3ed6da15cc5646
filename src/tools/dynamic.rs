//! Runtime-discovered tools (plugin servers and the like).
//!
//! Discovered tools carry only a name, description and schema; their tier
//! comes from configuration or defaults to `Execute`.

use std::sync::Arc;

use async_trait::async_trait;

use super::arguments::ToolArguments;
use super::tool::{Tool, ToolContext};
use super::types::ToolParameters;
use crate::error::WardenError;

/// A tool advertised by a [`DynamicToolProvider`].
#[derive(Debug, Clone)]
pub struct DynamicTool {
    pub name: String,
    pub description: String,
    pub parameters: ToolParameters,
}

/// A source of tools discovered at runtime and executed by name.
#[async_trait]
pub trait DynamicToolProvider: Send + Sync {
    /// List available tools.
    async fn list_tools(&self) -> Result<Vec<DynamicTool>, WardenError>;

    /// Execute a tool by name.
    async fn execute_tool(
        &self,
        name: &str,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, WardenError>;
}

/// Exposes one [`DynamicTool`] through the [`Tool`] trait.
pub struct DynamicToolAdapter {
    provider: Arc<dyn DynamicToolProvider>,
    tool: DynamicTool,
}

impl DynamicToolAdapter {
    pub fn new(provider: Arc<dyn DynamicToolProvider>, tool: DynamicTool) -> Self {
        Self { provider, tool }
    }
}

#[async_trait]
impl Tool for DynamicToolAdapter {
    fn name(&self) -> &str {
        &self.tool.name
    }

    fn description(&self) -> &str {
        &self.tool.description
    }

    fn parameters(&self) -> &ToolParameters {
        &self.tool.parameters
    }

    async fn execute(
        &self,
        args: &ToolArguments,
        ctx: &ToolContext,
    ) -> Result<serde_json::Value, WardenError> {
        self.provider.execute_tool(&self.tool.name, args, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingProvider {
        last_call: Mutex<Option<String>>,
    }

    #[async_trait]
    impl DynamicToolProvider for RecordingProvider {
        async fn list_tools(&self) -> Result<Vec<DynamicTool>, WardenError> {
            Ok(Vec::new())
        }

        async fn execute_tool(
            &self,
            name: &str,
            _args: &ToolArguments,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value, WardenError> {
            *self.last_call.lock().unwrap() = Some(name.to_string());
            Ok(serde_json::json!({ "ok": true }))
        }
    }

    #[tokio::test]
    async fn adapter_delegates_by_name_and_has_no_static_tier() {
        let provider = Arc::new(RecordingProvider {
            last_call: Mutex::new(None),
        });
        let adapter = DynamicToolAdapter::new(
            provider.clone(),
            DynamicTool {
                name: "fetch_issue".into(),
                description: "Fetch an issue".into(),
                parameters: ToolParameters::empty(),
            },
        );

        let result = adapter
            .execute(&ToolArguments::new(serde_json::json!({})), &ToolContext::default())
            .await
            .unwrap();

        assert_eq!(result["ok"], true);
        assert_eq!(adapter.tier(), None);
        assert_eq!(provider.last_call.lock().unwrap().as_deref(), Some("fetch_issue"));
    }
}
