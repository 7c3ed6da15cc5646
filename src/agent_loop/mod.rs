//! Agent loop: model calls, tool fan-out, compaction and follow-up chaining.

pub mod compaction;
pub mod events;
pub mod runner;
mod tooling;
pub mod types;

pub use events::LoopEvent;
pub use runner::{AgentLoop, LoopOptions, LoopServices, LoopSession};
pub use types::{LoopState, RunResult, RunStatus};
