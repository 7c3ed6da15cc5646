//! Warden: the core of a tool-using LLM agent.
//!
//! An agent loop alternates model calls with tool execution. Every tool call
//! is classified by risk and, when needed, held until a human approves it;
//! nested sub-agents run under concurrency, depth and time budgets; events
//! reach observers in this process directly and sibling processes through a
//! durable change log; and each conversation has at most one live loop.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use warden::prelude::*;
//!
//! # async fn example() -> warden::error::Result<()> {
//! let config = WardenConfig::from_env()?;
//! let provider = warden::provider::create_provider(&config.provider)?;
//! let store = Arc::new(SqliteStore::open("warden.db")?);
//! let ctx = WardenContext::open(config, store, provider).await?;
//! let _background = ctx.start_background();
//!
//! let mut events = ctx.subscribe(Channel::conversation("demo"));
//! ctx.submit("demo", "List the files in the current directory").await?;
//! while let Some(event) = events.recv().await {
//!     println!("{} {}", event.kind, event.payload);
//! }
//! # Ok(())
//! # }
//! ```

pub mod agent_loop;
pub mod approval;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod prelude;
pub mod provider;
pub mod safety;
pub mod store;
pub mod stream;
pub mod subagent;
pub mod tools;
pub mod types;
pub mod util;

pub use context::WardenContext;
