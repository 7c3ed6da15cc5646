//! Chat Completions provider for OpenAI and any API that speaks its wire
//! format (vLLM, LM Studio, OpenRouter, Together, ...).

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Result, WardenError};
use crate::types::{AgentToolCall, ContentPart, ModelDelta, ModelMessage, Role, Usage};

use super::http::{bearer_headers, parse_sse_data, shared_client, status_to_error};
use super::{DeltaStream, ModelProvider, ModelRequest};

pub struct OpenAiCompatibleProvider {
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAiCompatibleProvider {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            api_key: api_key.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model
    }

    fn build_request_body(&self, request: &ModelRequest, stream: bool) -> serde_json::Value {
        let messages = request.messages.iter().map(message_to_openai).collect::<Vec<_>>();

        let mut body = serde_json::json!({
            "model": request.model.as_deref().unwrap_or(&self.model),
            "messages": messages,
            "stream": stream,
        });

        let Some(obj) = body.as_object_mut() else {
            return body;
        };
        if stream {
            obj.insert("stream_options".into(), serde_json::json!({ "include_usage": true }));
        }
        if let Some(max) = request.max_tokens {
            obj.insert("max_tokens".into(), max.into());
        }
        if let Some(temp) = request.temperature {
            obj.insert("temperature".into(), temp.into());
        }
        if !request.tools.is_empty() {
            let tool_defs: Vec<serde_json::Value> = request
                .tools
                .iter()
                .map(|t| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            obj.insert("tools".into(), tool_defs.into());
        }

        body
    }

    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = shared_client()
            .post(&url)
            .headers(bearer_headers(&self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    WardenError::TransientModel(e.to_string())
                } else {
                    WardenError::Network(e)
                }
            })?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(status_to_error(status, &body_text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatibleProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn stream_chat(&self, request: &ModelRequest) -> Result<DeltaStream> {
        let body = self.build_request_body(request, true);
        debug!(model = %self.model, messages = request.messages.len(), "stream_chat");
        let resp = self.post(&body).await?;
        let byte_stream = resp.bytes_stream();

        let stream = async_stream::stream! {
            let mut buffer = String::new();
            let mut calls: BTreeMap<u32, PartialCall> = BTreeMap::new();
            let mut usage: Option<Usage> = None;
            let mut finished = false;
            futures::pin_mut!(byte_stream);

            'read: while let Some(chunk_result) = byte_stream.next().await {
                let chunk = match chunk_result {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(WardenError::TransientModel(format!("stream interrupted: {e}")));
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim().to_string();
                    buffer.drain(..=line_end);

                    if line.is_empty() || line.starts_with(':') {
                        continue;
                    }
                    if line.strip_prefix("data:").map(str::trim) == Some("[DONE]") {
                        finished = true;
                        break 'read;
                    }
                    let Some(data) = parse_sse_data(&line) else { continue };
                    let chunk = match serde_json::from_str::<StreamChunk>(data) {
                        Ok(chunk) => chunk,
                        Err(e) => {
                            debug!(error = %e, "skipping unparseable stream chunk");
                            continue;
                        }
                    };
                    if let Some(u) = chunk.usage {
                        usage = Some(Usage {
                            input_tokens: u.prompt_tokens,
                            output_tokens: u.completion_tokens,
                        });
                    }
                    for choice in chunk.choices {
                        if let Some(reasoning) = choice.delta.reasoning_content.filter(|r| !r.is_empty()) {
                            yield Ok(ModelDelta::reasoning(reasoning));
                        }
                        if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                            yield Ok(ModelDelta::text(text));
                        }
                        for tc in choice.delta.tool_calls.unwrap_or_default() {
                            let entry = calls.entry(tc.index).or_default();
                            if let Some(id) = tc.id {
                                entry.id = Some(id);
                            }
                            if let Some(function) = tc.function {
                                if let Some(name) = function.name {
                                    entry.name.push_str(&name);
                                }
                                if let Some(args) = function.arguments {
                                    entry.arguments.push_str(&args);
                                }
                            }
                        }
                        if choice.finish_reason.is_some() {
                            finished = true;
                        }
                    }
                }
            }

            if !finished {
                yield Err(WardenError::TransientModel("stream ended before completion".into()));
                return;
            }
            for (index, call) in calls {
                yield Ok(ModelDelta::tool_call(call.into_call(index)));
            }
            yield Ok(ModelDelta::done(usage));
        };

        Ok(Box::pin(stream))
    }

    async fn complete(&self, request: &ModelRequest) -> Result<String> {
        let body = self.build_request_body(request, false);
        debug!(model = %self.model, "complete");
        let resp = self.post(&body).await?;
        let data: ChatResponse = resp.json().await?;
        let choice = data
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| WardenError::api(200, "No choices in response"))?;
        Ok(choice.message.content.unwrap_or_default())
    }
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl PartialCall {
    fn into_call(self, index: u32) -> AgentToolCall {
        let arguments = if self.arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(&self.arguments)
                .unwrap_or(serde_json::Value::String(self.arguments))
        };
        AgentToolCall {
            id: self.id.unwrap_or_else(|| format!("call_{index}")),
            name: self.name,
            arguments,
        }
    }
}

fn message_to_openai(msg: &ModelMessage) -> serde_json::Value {
    if let Some(result) = msg.tool_result_part() {
        let content = match &result.result {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return serde_json::json!({
            "role": "tool",
            "tool_call_id": result.tool_call_id,
            "content": content,
        });
    }

    let role = match msg.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let tool_calls = msg.tool_calls();
    if !tool_calls.is_empty() {
        let tc_json: Vec<serde_json::Value> = tool_calls
            .iter()
            .map(|tc| {
                serde_json::json!({
                    "id": tc.id,
                    "type": "function",
                    "function": {
                        "name": tc.name,
                        "arguments": tc.arguments.to_string(),
                    }
                })
            })
            .collect();
        let text = msg.text();
        return serde_json::json!({
            "role": role,
            "content": if text.is_empty() { serde_json::Value::Null } else { serde_json::Value::String(text) },
            "tool_calls": tc_json,
        });
    }

    let text: String = msg
        .content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    serde_json::json!({ "role": role, "content": text })
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<WireUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
    tool_calls: Option<Vec<ToolCallChunk>>,
}

#[derive(Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    index: u32,
    id: Option<String>,
    function: Option<FunctionChunk>,
}

#[derive(Deserialize)]
struct FunctionChunk {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}
