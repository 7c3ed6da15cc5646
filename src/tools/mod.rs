//! Tool system: trait, registry, argument handling and built-in tools.

pub mod arguments;
pub mod builtin;
pub mod dynamic;
pub mod registry;
pub mod tool;
pub mod types;
pub mod validation;

pub use arguments::ToolArguments;
pub use dynamic::{DynamicTool, DynamicToolAdapter, DynamicToolProvider};
pub use registry::{RegisteredTool, ToolOrigin, ToolRegistry};
pub use tool::{AgentTool, Tool, ToolContext};
pub use types::{ToolDefinition, ToolParameters};
pub use validation::validate_arguments;
