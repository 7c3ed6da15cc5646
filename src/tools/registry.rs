//! Name → {schema, tier, handler} lookup.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::dynamic::{DynamicToolAdapter, DynamicToolProvider};
use super::tool::Tool;
use super::types::ToolDefinition;
use crate::error::Result;
use crate::safety::{default_tier, ToolTier};

/// Where a registered tool came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOrigin {
    Builtin,
    Dynamic,
}

/// A registry entry.
#[derive(Clone)]
pub struct RegisteredTool {
    pub tool: Arc<dyn Tool>,
    pub tier: ToolTier,
    pub origin: ToolOrigin,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.tool.name())
            .field("tier", &self.tier)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Tool lookup table. Registration replaces any tool with the same name.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, RegisteredTool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a statically known tool.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.insert(tool, ToolOrigin::Builtin);
    }

    /// Discover and register every tool a provider advertises. Returns the names added.
    pub async fn register_dynamic(&self, provider: Arc<dyn DynamicToolProvider>) -> Result<Vec<String>> {
        let discovered = provider.list_tools().await?;
        let mut names = Vec::with_capacity(discovered.len());
        for tool in discovered {
            names.push(tool.name.clone());
            let adapter: Arc<dyn Tool> = Arc::new(DynamicToolAdapter::new(provider.clone(), tool));
            self.insert(adapter, ToolOrigin::Dynamic);
        }
        tracing::debug!(count = names.len(), "registered dynamic tools");
        Ok(names)
    }

    fn insert(&self, tool: Arc<dyn Tool>, origin: ToolOrigin) {
        let name = tool.name().to_string();
        let builtin_default = match origin {
            ToolOrigin::Builtin => default_tier(&name),
            ToolOrigin::Dynamic => None,
        };
        let tier = tool.tier().or(builtin_default).unwrap_or(ToolTier::Execute);
        let entry = RegisteredTool { tool, tier, origin };
        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.insert(name.clone(), entry).is_some() {
            tracing::debug!(tool = %name, "replaced registered tool");
        }
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<RegisteredTool> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Definitions to advertise to the model, minus `excluded` names.
    pub fn definitions(&self, excluded: &[&str]) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| !excluded.contains(&entry.tool.name()))
            .map(|entry| ToolDefinition {
                name: entry.tool.name().to_string(),
                description: entry.tool.description().to_string(),
                parameters: entry.tool.parameters().schema.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::dynamic::DynamicTool;
    use crate::tools::{AgentTool, ToolArguments, ToolContext, ToolParameters};
    use async_trait::async_trait;

    fn noop(name: &str) -> AgentTool {
        AgentTool::new(name, "noop", ToolParameters::empty(), |_, _| async {
            Ok(serde_json::Value::Null)
        })
    }

    #[test]
    fn tier_comes_from_tool_then_table_then_execute() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(noop("custom").with_tier(ToolTier::Read)));
        registry.register(Arc::new(noop("delete_file")));
        registry.register(Arc::new(noop("mystery")));

        assert_eq!(registry.get("custom").unwrap().tier, ToolTier::Read);
        assert_eq!(registry.get("delete_file").unwrap().tier, ToolTier::Destructive);
        assert_eq!(registry.get("mystery").unwrap().tier, ToolTier::Execute);
    }

    #[test]
    fn definitions_skip_excluded_names() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(noop("read_file")));
        registry.register(Arc::new(noop("run_agent")));

        let defs = registry.definitions(&["run_agent"]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "read_file");
    }

    struct Plugin;

    #[async_trait]
    impl DynamicToolProvider for Plugin {
        async fn list_tools(&self) -> Result<Vec<DynamicTool>> {
            Ok(vec![DynamicTool {
                name: "read_file".into(),
                description: "shadowing plugin tool".into(),
                parameters: ToolParameters::empty(),
            }])
        }

        async fn execute_tool(
            &self,
            _name: &str,
            _args: &ToolArguments,
            _ctx: &ToolContext,
        ) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
    }

    #[tokio::test]
    async fn dynamic_tools_register_by_name() {
        let registry = ToolRegistry::new();
        let names = registry.register_dynamic(Arc::new(Plugin)).await.unwrap();

        assert_eq!(names, vec!["read_file".to_string()]);
        let entry = registry.get("read_file").unwrap();
        assert_eq!(entry.origin, ToolOrigin::Dynamic);
        assert_eq!(entry.tier, ToolTier::Execute);
        assert!(registry.unregister("read_file"));
        assert!(!registry.contains("read_file"));
    }
}
