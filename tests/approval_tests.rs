//! Approval flows end to end: classification, the gate and the loop together.

mod common;

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use common::{context, ScriptedProvider, Step};
use warden::agent_loop::{AgentLoop, LoopOptions, RunStatus};
use warden::approval::{ApprovalRequest, ApprovalScope};
use warden::config::{SafetyConfig, WardenConfig};
use warden::error::WardenError;
use warden::events::{Channel, EventKind, Subscription};
use warden::safety::{classify, ApprovalMode, Classification, SafetyPolicy, ToolTier};
use warden::tools::{AgentTool, ToolParameters};
use warden::types::ModelMessage;

async fn next_request(events: &mut Subscription) -> ApprovalRequest {
    loop {
        let event = events.recv().await.expect("event stream closed");
        if event.kind == EventKind::ApprovalRequired {
            return serde_json::from_value(event.payload).unwrap();
        }
    }
}

fn counting_tool(name: &str, tier: ToolTier, calls: Arc<AtomicUsize>) -> Arc<AgentTool> {
    Arc::new(
        AgentTool::new(name, "counts invocations", ToolParameters::empty(), move |_args, _ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "ok": true }))
            }
        })
        .with_tier(tier),
    )
}

#[test]
fn write_tier_needs_approval_when_asking_for_writes() {
    let empty = BTreeSet::new();
    let classification = classify("write_file", ToolTier::Write, ApprovalMode::AskForWrites, &empty, &empty);
    assert_eq!(classification, Classification::RequireApproval);
}

#[test]
fn recursive_delete_needs_approval_even_in_auto_mode() {
    let config = SafetyConfig {
        approval_mode: ApprovalMode::Auto,
        ..SafetyConfig::default()
    };
    let policy = SafetyPolicy::from_config(&config).unwrap();

    let verdict = policy.evaluate(
        "run_command",
        ToolTier::Destructive,
        &json!({ "command": "rm -rf ./build" }),
        false,
    );
    assert_eq!(verdict.classification, Classification::RequireApproval);
    assert!(verdict.pattern.is_some());

    let harmless = policy.evaluate("run_command", ToolTier::Destructive, &json!({ "command": "ls" }), false);
    assert_eq!(harmless.classification, Classification::AutoAllow);
}

#[test]
fn deny_list_wins_in_every_mode() {
    let denied: BTreeSet<String> = ["run_command".to_string()].into();
    let allowed = denied.clone();
    for mode in [ApprovalMode::Auto, ApprovalMode::AskForDangerous, ApprovalMode::AskForWrites] {
        for tier in [ToolTier::Read, ToolTier::Write, ToolTier::Execute, ToolTier::Destructive] {
            assert_eq!(classify("run_command", tier, mode, &allowed, &denied), Classification::HardDeny);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn unanswered_approval_times_out_as_denied_result() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Step::tool_calls(&[("c-1", "note", json!({}))]),
        Step::text("gave up"),
    ]));
    let mut config = WardenConfig::default();
    config.safety.approval_timeout = 10;
    let ctx = context(config, provider).await;
    let calls = Arc::new(AtomicUsize::new(0));
    ctx.registry().register(counting_tool("note", ToolTier::Write, calls.clone()));
    let mut events = ctx.subscribe(Channel::conversation("c1"));

    let agent = AgentLoop::new(ctx.services().clone(), LoopOptions::builder().conversation_id("c1").build());
    let started = tokio::time::Instant::now();
    let result = agent
        .run(vec![ModelMessage::user("note this")], &CancellationToken::new(), None)
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(started.elapsed() >= std::time::Duration::from_secs(10));

    let denied = result.messages[2].tool_result_part().unwrap();
    assert!(denied.is_error);
    assert!(denied.result["error"].as_str().unwrap().contains("timed out after 10s"));

    let request = next_request(&mut events).await;
    let mut resolution = None;
    while let Some(event) = events.try_recv() {
        if event.kind == EventKind::ApprovalResolved {
            resolution = Some(event.payload);
        }
    }
    let resolution = resolution.expect("approval_resolved event");
    assert_eq!(resolution["id"], request.id.as_str());
    assert_eq!(resolution["resolution"], "timed_out");

    let err = ctx.respond(&request.id, true, ApprovalScope::Once).await.unwrap_err();
    assert!(matches!(err, WardenError::NotFound(_)));
}

#[tokio::test]
async fn session_approval_runs_the_tool_and_covers_later_calls() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        Step::tool_calls(&[("c-1", "note", json!({}))]),
        Step::tool_calls(&[("c-2", "note", json!({}))]),
        Step::text("noted twice"),
    ]));
    let ctx = Arc::new(context(WardenConfig::default(), provider).await);
    let calls = Arc::new(AtomicUsize::new(0));
    ctx.registry().register(counting_tool("note", ToolTier::Write, calls.clone()));
    let mut events = ctx.subscribe(Channel::conversation("c1"));

    let observer = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let request = next_request(&mut events).await;
            assert_eq!(request.tool_name, "note");
            ctx.respond(&request.id, true, ApprovalScope::Session).await.unwrap();
            let duplicate = ctx.respond(&request.id, true, ApprovalScope::Session).await;
            assert!(matches!(duplicate, Err(WardenError::NotFound(_))));
            let mut later_prompts = 0;
            while let Some(event) = events.recv().await {
                match event.kind {
                    EventKind::ApprovalRequired => later_prompts += 1,
                    EventKind::Done => break,
                    _ => {}
                }
            }
            later_prompts
        })
    };

    let agent = AgentLoop::new(ctx.services().clone(), LoopOptions::builder().conversation_id("c1").build());
    let result = agent
        .run(vec![ModelMessage::user("note twice")], &CancellationToken::new(), None)
        .await;

    assert_eq!(result.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(observer.await.unwrap(), 0);
    assert!(ctx.gate().permissions().contains("note"));

    let audit = ctx.store().load_tool_calls("c1").await.unwrap();
    assert_eq!(audit.len(), 2);
}

#[tokio::test]
async fn always_grant_survives_a_new_context_on_the_same_store() {
    let store = Arc::new(warden::store::MemoryStore::new());
    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let first = warden::WardenContext::open(WardenConfig::default(), store.clone(), provider.clone())
        .await
        .unwrap();
    let mut events = first.subscribe(Channel::conversation("c1"));

    let gate = first.gate().clone();
    let call = common::call("c-1", "write_file", json!({ "path": "a.txt", "content": "x" }));
    let waiter = tokio::spawn(async move {
        gate.authorize("c1", &call, ToolTier::Write, 0, &CancellationToken::new())
            .await
    });
    let request = next_request(&mut events).await;
    first.respond(&request.id, true, ApprovalScope::Always).await.unwrap();
    assert!(waiter.await.unwrap().allowed());

    let second = warden::WardenContext::open(WardenConfig::default(), store, provider)
        .await
        .unwrap();
    let verdict = second.gate().policy().evaluate(
        "write_file",
        ToolTier::Write,
        &json!({ "path": "b.txt" }),
        false,
    );
    assert_eq!(verdict.classification, Classification::AutoAllow);
}
