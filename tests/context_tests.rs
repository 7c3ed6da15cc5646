//! Context wiring: configuration, persisted settings and tool registration.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{call, ScriptedProvider};
use warden::approval::ToolDecision;
use warden::config::WardenConfig;
use warden::error::WardenError;
use warden::events::{Channel, EventKind};
use warden::safety::{ApprovalMode, ToolTier};
use warden::store::SqliteStore;
use warden::tools::{DynamicTool, DynamicToolProvider, ToolArguments, ToolContext, ToolParameters};
use warden::WardenContext;

struct PluginServer;

#[async_trait]
impl DynamicToolProvider for PluginServer {
    async fn list_tools(&self) -> Result<Vec<DynamicTool>, WardenError> {
        Ok(vec![
            DynamicTool {
                name: "plugin_search".into(),
                description: "search the plugin index".into(),
                parameters: ToolParameters::empty(),
            },
            DynamicTool {
                name: "plugin_lookup".into(),
                description: "look one entry up".into(),
                parameters: ToolParameters::empty(),
            },
        ])
    }

    async fn execute_tool(
        &self,
        name: &str,
        _args: &ToolArguments,
        _ctx: &ToolContext,
    ) -> Result<serde_json::Value, WardenError> {
        Ok(json!({ "tool": name }))
    }
}

#[tokio::test]
async fn context_registers_builtins_and_run_agent() {
    let ctx = common::context(WardenConfig::default(), Arc::new(ScriptedProvider::new(vec![]))).await;
    let names = ctx.registry().names();
    for tool in [
        "read_file",
        "list_directory",
        "write_file",
        "edit_file",
        "run_command",
        "delete_file",
        "run_agent",
    ] {
        assert!(names.contains(&tool.to_string()), "missing {tool}");
    }
    assert_eq!(ctx.registry().get("delete_file").unwrap().tier, ToolTier::Destructive);
}

#[tokio::test]
async fn dynamic_tools_default_to_execute_unless_configured() {
    let mut config = WardenConfig::default();
    config.safety.approval_mode = ApprovalMode::AskForDangerous;
    config.safety.tool_tiers.insert("plugin_lookup".into(), ToolTier::Destructive);
    let ctx = common::context(config, Arc::new(ScriptedProvider::new(vec![]))).await;

    let added = ctx.register_dynamic_tools(Arc::new(PluginServer)).await.unwrap();
    assert_eq!(added.len(), 2);
    assert_eq!(ctx.registry().get("plugin_search").unwrap().tier, ToolTier::Execute);

    let cancel = CancellationToken::new();
    let search = ctx
        .gate()
        .authorize("c1", &call("c-1", "plugin_search", json!({})), ToolTier::Execute, 0, &cancel)
        .await;
    assert_eq!(search.decision, ToolDecision::AutoAllowed);

    let lookup = ctx
        .gate()
        .authorize("c1", &call("c-2", "plugin_lookup", json!({})), ToolTier::Execute, 0, &cancel)
        .await;
    assert_eq!(lookup.tier, ToolTier::Destructive);
    assert!(!lookup.allowed());
}

#[tokio::test]
async fn saved_safety_settings_apply_to_the_next_context() {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("warden.db");
    let provider = Arc::new(ScriptedProvider::new(vec![]));

    let first = WardenContext::open(
        WardenConfig::default(),
        Arc::new(SqliteStore::open(&db).unwrap()),
        provider.clone(),
    )
    .await
    .unwrap();
    let mut notices = first.subscribe(Channel::database("main"));

    let mut updated = first.config();
    updated.safety.denied_tools.insert("run_command".into());
    updated.subagent.max_depth = 1;
    first.update_config(updated).await.unwrap();

    assert_eq!(notices.recv().await.unwrap().kind, EventKind::ConfigChanged);
    let blocked = first
        .gate()
        .authorize(
            "c1",
            &call("c-1", "run_command", json!({ "command": "ls" })),
            ToolTier::Execute,
            0,
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(blocked.decision, ToolDecision::HardBlocked);

    let second = WardenContext::open(
        WardenConfig::default(),
        Arc::new(SqliteStore::open(&db).unwrap()),
        provider,
    )
    .await
    .unwrap();
    assert!(second.config().safety.denied_tools.contains("run_command"));
    assert_eq!(second.limiter().max_depth(), 1);
}

#[tokio::test]
async fn updated_timeouts_reach_the_gate_and_stream_manager() {
    let ctx = common::context(WardenConfig::default(), Arc::new(ScriptedProvider::new(vec![]))).await;
    assert_eq!(ctx.gate().timeout(), Duration::from_secs(120));

    let mut updated = ctx.config();
    updated.safety.approval_timeout = 10;
    updated.safety.max_pending_approvals = 3;
    ctx.update_config(updated).await.unwrap();

    assert_eq!(ctx.gate().timeout(), Duration::from_secs(10));
    assert_eq!(ctx.gate().settings().max_pending, 3);
    assert_eq!(ctx.streams().stale_after(), Duration::from_secs(40));
    assert_eq!(ctx.config().stale_after(), ctx.streams().stale_after());
}

#[test]
fn toml_file_round_trips_through_disk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nested").join("warden.toml");

    let mut config = WardenConfig::default();
    config.safety.approval_mode = ApprovalMode::Auto;
    config.subagent.max_concurrent = 2;
    config.save(&path).unwrap();

    let loaded = WardenConfig::load(&path).unwrap();
    assert_eq!(loaded.safety.approval_mode, ApprovalMode::Auto);
    assert_eq!(loaded.subagent.max_concurrent, 2);
}

#[test]
fn ask_is_accepted_as_an_alias() {
    let config = WardenConfig::from_toml_str(
        r#"
        [safety]
        approval_mode = "ask"
        approval_timeout = 5
        "#,
    )
    .unwrap();
    assert_eq!(config.safety.approval_mode, ApprovalMode::AskForWrites);
    assert_eq!(config.safety.approval_timeout, 10);
    assert!(config.to_toml_string().unwrap().contains("ask_for_writes"));
}
