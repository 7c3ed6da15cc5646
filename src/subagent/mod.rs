//! Nested agent runs: budget enforcement and the `run_agent` tool.

pub mod limiter;
pub mod runner;
pub mod task;

pub use limiter::{SubagentLimiter, SubagentPermit};
pub use runner::{RunAgentTool, SubagentRunner, SUBAGENT_SYSTEM_PROMPT};
pub use task::{SubagentStatus, SubagentTask};
