//! History compaction.
//!
//! Token counts are estimated (four characters per token plus a small
//! per-message overhead). Once the estimate reaches the ceiling, the whole
//! history is summarised by one extra model call and replaced with a single
//! entry.

use crate::error::Result;
use crate::provider::{ModelProvider, ModelRequest};
use crate::types::{ContentPart, ModelMessage};
use crate::util::text::truncate_chars;

const MESSAGE_OVERHEAD_TOKENS: usize = 4;
/// Per-part cap when rendering history for the summariser.
const TRANSCRIPT_PART_CHARS: usize = 2_000;

pub const SUMMARY_PREFIX: &str = "Summary of the conversation so far:";

const SUMMARY_INSTRUCTIONS: &str = "You compress agent transcripts. Summarise the conversation below \
so the agent can continue the task: keep the user's goals, decisions made, files and commands \
touched, tool results that still matter, and open problems. Be concise and factual.";

pub fn estimate_tokens(messages: &[ModelMessage]) -> usize {
    messages
        .iter()
        .map(|m| {
            let chars: usize = m
                .content
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::ToolCall(call) => call.name.len() + call.arguments.to_string().len(),
                    ContentPart::ToolResult(result) => result.result.to_string().len(),
                })
                .sum();
            chars.div_ceil(4) + MESSAGE_OVERHEAD_TOKENS
        })
        .sum()
}

pub fn needs_compaction(messages: &[ModelMessage], token_ceiling: usize) -> bool {
    estimate_tokens(messages) >= token_ceiling
}

fn render_transcript(messages: &[ModelMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        for part in &message.content {
            let line = match part {
                ContentPart::Text { text } => format!("{}: {}", message.role, truncate_chars(text, TRANSCRIPT_PART_CHARS)),
                ContentPart::ToolCall(call) => format!(
                    "{} called {}({})",
                    message.role,
                    call.name,
                    truncate_chars(&call.arguments.to_string(), TRANSCRIPT_PART_CHARS)
                ),
                ContentPart::ToolResult(result) => format!(
                    "tool result{}: {}",
                    if result.is_error { " (error)" } else { "" },
                    truncate_chars(&result.result.to_string(), TRANSCRIPT_PART_CHARS)
                ),
            };
            out.push_str(&line);
            out.push('\n');
        }
    }
    out
}

/// Summarise `messages` into one replacement entry.
///
/// Returns `None` without calling the model when the history is shorter than
/// `min_messages`.
pub async fn compact(
    provider: &dyn ModelProvider,
    messages: &[ModelMessage],
    min_messages: usize,
    model: Option<String>,
) -> Result<Option<ModelMessage>> {
    if messages.len() < min_messages {
        return Ok(None);
    }
    let request = ModelRequest::builder()
        .messages(vec![
            ModelMessage::system(SUMMARY_INSTRUCTIONS),
            ModelMessage::user(render_transcript(messages)),
        ])
        .maybe_model(model)
        .build();
    let summary = provider.complete(&request).await?;
    Ok(Some(ModelMessage::user(format!("{SUMMARY_PREFIX}\n{}", summary.trim()))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::DeltaStream;
    use crate::types::AgentToolCall;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Summariser {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ModelProvider for Summariser {
        fn name(&self) -> &str {
            "summariser"
        }

        async fn stream_chat(&self, _request: &ModelRequest) -> Result<DeltaStream> {
            unreachable!("compaction never streams")
        }

        async fn complete(&self, request: &ModelRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.messages[1].text().contains("read_file"));
            Ok("user wants a README; read_file found none".into())
        }
    }

    fn history(n: usize) -> Vec<ModelMessage> {
        (0..n)
            .map(|i| match i % 3 {
                0 => ModelMessage::user("x".repeat(400)),
                1 => ModelMessage::assistant_with_tool_calls(
                    "",
                    vec![AgentToolCall {
                        id: format!("c{i}"),
                        name: "read_file".into(),
                        arguments: json!({"path": "README.md"}),
                    }],
                ),
                _ => ModelMessage::tool_result(format!("c{}", i - 1), json!({"error": "not found"}), true),
            })
            .collect()
    }

    #[test]
    fn estimate_counts_chars_and_overhead() {
        let messages = vec![ModelMessage::user("abcdefgh"), ModelMessage::assistant("abc")];
        assert_eq!(estimate_tokens(&messages), 2 + 4 + 1 + 4);
        assert!(needs_compaction(&messages, 11));
        assert!(!needs_compaction(&messages, 12));
    }

    #[tokio::test]
    async fn short_history_is_left_alone() {
        let provider = Summariser { calls: AtomicUsize::new(0) };
        let out = compact(&provider, &history(3), 6, None).await.unwrap();
        assert!(out.is_none());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn long_history_becomes_one_entry() {
        let provider = Summariser { calls: AtomicUsize::new(0) };
        let summary = compact(&provider, &history(9), 6, None).await.unwrap().unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
        assert!(summary.text().starts_with(SUMMARY_PREFIX));
        assert!(summary.text().contains("README"));
    }
}
