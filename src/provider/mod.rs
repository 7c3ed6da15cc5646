//! Model provider contract.
//!
//! The agent loop only needs two things from a model: a streaming chat turn
//! (text, reasoning and tool-call deltas) and a one-shot completion used for
//! history summarisation.

pub mod http;
#[cfg(feature = "openai-compatible")]
pub mod openai_compatible;

#[cfg(feature = "openai-compatible")]
pub use openai_compatible::OpenAiCompatibleProvider;

use std::sync::Arc;

use async_trait::async_trait;
use bon::Builder;
use futures::stream::BoxStream;

use crate::config::ProviderConfig;
use crate::error::{Result, WardenError};
use crate::tools::ToolDefinition;
use crate::types::{ModelDelta, ModelMessage};

/// A request sent to a model provider.
#[derive(Debug, Clone, Default, Builder)]
pub struct ModelRequest {
    #[builder(default)]
    pub messages: Vec<ModelMessage>,
    #[builder(default)]
    pub tools: Vec<ToolDefinition>,
    /// Overrides the provider's configured model for this request.
    #[builder(into)]
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
}

/// Stream of deltas for one model turn.
pub type DeltaStream = BoxStream<'static, Result<ModelDelta>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Start a streaming turn. Errors before the first byte (HTTP status,
    /// connection) are returned here; errors mid-stream are stream items.
    async fn stream_chat(&self, request: &ModelRequest) -> Result<DeltaStream>;

    /// Non-streaming completion returning only the text.
    async fn complete(&self, request: &ModelRequest) -> Result<String>;
}

/// Build the provider described by configuration.
#[cfg(feature = "openai-compatible")]
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn ModelProvider>> {
    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| WardenError::Authentication("Missing OPENAI_API_KEY".into()))?;
    Ok(Arc::new(OpenAiCompatibleProvider::new(
        config.model.clone(),
        api_key,
        config.base_url.clone(),
    )))
}

#[cfg(not(feature = "openai-compatible"))]
pub fn create_provider(_config: &ProviderConfig) -> Result<Arc<dyn ModelProvider>> {
    Err(WardenError::Configuration(
        "no model provider compiled in; enable the `openai-compatible` feature".into(),
    ))
}
