//! SSE stream accumulator for OpenAI-compatible Chat Completions APIs.
//!
//! The streaming format sends `data:` lines with JSON payloads containing
//! `choices[].delta` objects and terminates with a `data: [DONE]` sentinel.
//! Text deltas are simple string concatenation.  Tool call deltas require
//! accumulating the function name and arguments across multiple chunks (the
//! name typically arrives in the first chunk, with argument fragments
//! following in subsequent chunks, correlated by `index`).
//!
//! This single accumulator serves every OpenAI-compatible backend valet
//! talks to: both secondary cloud providers and the local fallback model.

use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::provider::ToolRequest;
use crate::usage::TokenUsage;

/// Accumulates fragments from an OpenAI-compatible SSE stream.
#[derive(Debug, Default)]
pub struct ChatStreamAccumulator {
    /// The provider name, for error attribution.
    provider: String,

    /// Accumulated text content from `choices[].delta.content`.
    text: String,

    /// In-progress tool calls indexed by their position in the tool_calls
    /// array.
    tool_call_builders: Vec<ToolCallBuilder>,

    /// The finish reason, once reported.
    finish_reason: Option<String>,

    /// Whether the `[DONE]` sentinel has been received.
    done: bool,

    /// Token usage collected from chunks that include a `usage` field
    /// (sent in the final chunk before `[DONE]`).
    usage: TokenUsage,
}

/// In-progress tool call being assembled from streaming deltas.
#[derive(Debug, Default)]
struct ToolCallBuilder {
    /// The tool call id (e.g. `"call_abc123"`).
    id: String,
    /// The function name.
    name: String,
    /// Accumulated function arguments JSON string.
    arguments: String,
}

impl ChatStreamAccumulator {
    /// Create a new empty accumulator attributing errors to `provider`.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            ..Self::default()
        }
    }

    /// Returns `true` once the `[DONE]` sentinel has been received.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// The finish reason reported by the endpoint, if any.
    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    /// Feed a single SSE line from the stream.
    ///
    /// Returns `Ok(Some(text_delta))` when a text content delta is present
    /// (for incremental forwarding), `Ok(None)` for non-text events, or an
    /// error if parsing fails.
    pub fn feed_line(&mut self, line: &str) -> Result<Option<String>> {
        let line = line.trim_end();

        // Skip empty lines, comments, and non-data lines.
        if line.is_empty() || line.starts_with(':') {
            return Ok(None);
        }

        let data = match line.strip_prefix("data: ") {
            Some(d) => d.trim(),
            // Could be an `event:` line or other SSE field; ignore.
            None => return Ok(None),
        };

        // Check for the stream terminator.
        if data == "[DONE]" {
            self.done = true;
            return Ok(None);
        }

        // Parse the JSON payload.
        let v: Value = serde_json::from_str(data).map_err(|e| AgentError::StreamParse {
            provider: self.provider.clone(),
            reason: format!("invalid JSON in SSE data: {e}"),
        })?;

        // Usage arrives on the final chunk (with an empty choices array on
        // some endpoints), so read it wherever it appears.
        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            self.usage.input_tokens = usage["prompt_tokens"].as_u64().unwrap_or(0);
            self.usage.output_tokens = usage["completion_tokens"].as_u64().unwrap_or(0);
            if let Some(details) = usage.get("prompt_tokens_details") {
                self.usage.cache_read_tokens = details["cached_tokens"].as_u64().unwrap_or(0);
            }
        }

        let choice = &v["choices"][0];
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_owned());
        }

        let delta = &choice["delta"];
        if delta.is_null() {
            return Ok(None);
        }

        // Text content delta.
        let mut text_delta: Option<String> = None;
        if let Some(content) = delta["content"].as_str() {
            if !content.is_empty() {
                self.text.push_str(content);
                text_delta = Some(content.to_owned());
            }
        }

        // Tool call deltas, correlated by index.
        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;

                while self.tool_call_builders.len() <= index {
                    self.tool_call_builders.push(ToolCallBuilder::default());
                }
                let builder = &mut self.tool_call_builders[index];

                if let Some(id) = tc["id"].as_str() {
                    builder.id = id.to_owned();
                }
                if let Some(name) = tc["function"]["name"].as_str() {
                    builder.name.push_str(name);
                }
                if let Some(args) = tc["function"]["arguments"].as_str() {
                    builder.arguments.push_str(args);
                }
            }
        }

        Ok(text_delta)
    }

    /// Consume the accumulator, yielding the final text, the assembled tool
    /// requests in issue order, and the usage for this call.
    pub fn into_parts(self) -> Result<(String, Vec<ToolRequest>, TokenUsage)> {
        let provider = self.provider;
        let requests: Result<Vec<ToolRequest>> = self
            .tool_call_builders
            .into_iter()
            .map(|b| {
                let arguments: Value = if b.arguments.is_empty() {
                    Value::Object(Default::default())
                } else {
                    serde_json::from_str(&b.arguments).map_err(|e| AgentError::StreamParse {
                        provider: provider.clone(),
                        reason: format!("invalid JSON in tool call `{}` arguments: {e}", b.name),
                    })?
                };

                Ok(ToolRequest {
                    id: b.id,
                    name: b.name,
                    arguments,
                })
            })
            .collect();

        Ok((self.text, requests?, self.usage))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
