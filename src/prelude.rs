//! Convenience re-exports for common use.

pub use crate::agent_loop::{AgentLoop, LoopEvent, LoopOptions, LoopServices, RunResult, RunStatus};
pub use crate::approval::{ApprovalGate, ApprovalRequest, ApprovalScope};
pub use crate::config::WardenConfig;
pub use crate::context::WardenContext;
pub use crate::error::{Result, WardenError};
pub use crate::events::{Channel, Event, EventBus, EventKind, Subscription};
pub use crate::provider::{ModelProvider, ModelRequest};
pub use crate::safety::{classify, ApprovalMode, Classification, SafetyPolicy, ToolTier};
pub use crate::store::{MemoryStore, SqliteStore, Store};
pub use crate::stream::{StreamManager, SubmitOutcome};
pub use crate::tools::{AgentTool, Tool, ToolArguments, ToolContext, ToolParameters, ToolRegistry};
pub use crate::types::{ContentPart, ModelMessage, Role};
