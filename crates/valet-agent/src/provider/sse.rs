//! SSE stream parser for the Anthropic-style Messages API.
//!
//! The streaming format sends `event:` and `data:` lines in standard SSE
//! format.  This module parses those lines into typed [`WireEvent`] values
//! that the adapter translates into turn events.

use serde_json::Value;

use crate::error::{AgentError, Result};

/// Events emitted by the Messages API SSE stream.
///
/// These map to the `event:` field in the stream.
#[derive(Debug, Clone)]
pub enum WireEvent {
    /// The stream has started; input-side token counts are known here.
    MessageStart {
        /// The unique message id from the API.
        message_id: String,
        /// Number of input (prompt) tokens billed for this request.
        input_tokens: u64,
        /// Tokens written to the prompt cache for this request.
        cache_creation_tokens: u64,
        /// Tokens served from the prompt cache for this request.
        cache_read_tokens: u64,
    },

    /// A new content block has started (`"text"` or `"tool_use"`).
    ContentBlockStart {
        /// Zero-based index of the content block.
        index: u32,
        /// The type of content block.
        content_type: String,
        /// For tool_use blocks: the tool request id.
        id: Option<String>,
        /// For tool_use blocks: the tool name.
        name: Option<String>,
    },

    /// An incremental delta within a content block.
    ContentBlockDelta {
        /// The content block index this delta belongs to.
        index: u32,
        /// The delta variant.
        delta: WireDelta,
    },

    /// A content block has finished streaming.
    ContentBlockStop {
        /// The content block index that stopped.
        index: u32,
    },

    /// The overall message is winding down; output tokens are final here.
    MessageDelta {
        /// The stop reason (`"end_turn"`, `"tool_use"`, `"max_tokens"`, ...).
        stop_reason: Option<String>,
        /// Number of output tokens generated in this response.
        output_tokens: u64,
    },

    /// The stream has fully terminated.
    MessageStop,

    /// A ping / keepalive event (no payload).
    Ping,
}

/// Incremental delta within a streaming content block.
#[derive(Debug, Clone)]
pub enum WireDelta {
    /// A chunk of text.
    TextDelta(String),

    /// A chunk of JSON for a tool-use input.
    InputJsonDelta(String),
}

/// Parses raw SSE lines from a Messages API stream.
///
/// Accumulates partial state across calls because SSE events span multiple
/// lines (`event:` followed by `data:`).
#[derive(Debug, Default)]
pub struct SseParser {
    /// The provider name, for error attribution.
    provider: String,

    /// The most recently seen `event:` type.
    current_event_type: Option<String>,
}

impl SseParser {
    /// Create a new parser attributing errors to `provider`.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            current_event_type: None,
        }
    }

    /// Feed a single line from the SSE stream.
    ///
    /// Returns `Some(event)` when a complete event has been parsed, `None`
    /// for comment lines, blank lines, or the `event:` prefix line (which
    /// just sets internal state for the next `data:` line).
    pub fn parse_line(&mut self, line: &str) -> Result<Option<WireEvent>> {
        let line = line.trim_end();

        // SSE comment lines start with `:`.
        if line.starts_with(':') || line.is_empty() {
            return Ok(None);
        }

        // `event: <type>` -- stash the type for the next `data:` line.
        if let Some(event_type) = line.strip_prefix("event: ") {
            self.current_event_type = Some(event_type.to_owned());
            return Ok(None);
        }

        // `data: <json>` -- combine with the stashed event type.
        if let Some(data) = line.strip_prefix("data: ") {
            let event_type = self
                .current_event_type
                .take()
                .unwrap_or_else(|| "unknown".into());

            return self.parse_event(&event_type, data);
        }

        // Unknown line format; ignore gracefully.
        tracing::trace!(line, "ignoring unrecognised SSE line");
        Ok(None)
    }

    /// Parse a (event_type, data_json) pair into a [`WireEvent`].
    fn parse_event(&self, event_type: &str, data: &str) -> Result<Option<WireEvent>> {
        match event_type {
            "message_start" => {
                let v: Value = self.parse_json(data)?;
                let message = &v["message"];
                let usage = &message["usage"];
                Ok(Some(WireEvent::MessageStart {
                    message_id: json_string(message, "id"),
                    input_tokens: json_u64(usage, "input_tokens"),
                    cache_creation_tokens: json_u64(usage, "cache_creation_input_tokens"),
                    cache_read_tokens: json_u64(usage, "cache_read_input_tokens"),
                }))
            }

            "content_block_start" => {
                let v: Value = self.parse_json(data)?;
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let block = &v["content_block"];
                let content_type = json_string(block, "type");
                let id = block["id"].as_str().map(String::from);
                let name = block["name"].as_str().map(String::from);

                Ok(Some(WireEvent::ContentBlockStart {
                    index,
                    content_type,
                    id,
                    name,
                }))
            }

            "content_block_delta" => {
                let v: Value = self.parse_json(data)?;
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                let delta_obj = &v["delta"];
                let delta_type = json_string(delta_obj, "type");

                let delta = match delta_type.as_str() {
                    "text_delta" => WireDelta::TextDelta(json_string(delta_obj, "text")),
                    "input_json_delta" => {
                        WireDelta::InputJsonDelta(json_string(delta_obj, "partial_json"))
                    }
                    other => {
                        tracing::warn!(delta_type = other, "unknown delta type");
                        return Ok(None);
                    }
                };

                Ok(Some(WireEvent::ContentBlockDelta { index, delta }))
            }

            "content_block_stop" => {
                let v: Value = self.parse_json(data)?;
                let index = v["index"].as_u64().unwrap_or(0) as u32;
                Ok(Some(WireEvent::ContentBlockStop { index }))
            }

            "message_delta" => {
                let v: Value = self.parse_json(data)?;
                let stop_reason = v["delta"]["stop_reason"].as_str().map(String::from);
                let output_tokens = json_u64(&v["usage"], "output_tokens");
                Ok(Some(WireEvent::MessageDelta {
                    stop_reason,
                    output_tokens,
                }))
            }

            "message_stop" => Ok(Some(WireEvent::MessageStop)),

            "ping" => Ok(Some(WireEvent::Ping)),

            "error" => {
                let v: Value = self.parse_json(data)?;
                Err(AgentError::ProviderTransport {
                    provider: self.provider.clone(),
                    reason: format!(
                        "in-stream error event: {}",
                        v["error"]["message"].as_str().unwrap_or(data)
                    ),
                })
            }

            // `[DONE]` or any unrecognised event type.
            _ => {
                if data.trim() == "[DONE]" {
                    Ok(Some(WireEvent::MessageStop))
                } else {
                    tracing::trace!(event_type, "ignoring unknown SSE event type");
                    Ok(None)
                }
            }
        }
    }

    /// Parse a JSON string, mapping errors to [`AgentError::StreamParse`].
    fn parse_json(&self, data: &str) -> Result<Value> {
        serde_json::from_str(data).map_err(|e| AgentError::StreamParse {
            provider: self.provider.clone(),
            reason: format!("invalid JSON in SSE data: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract a string field from a JSON value, returning an empty string if
/// missing.
fn json_string(v: &Value, field: &str) -> String {
    v[field].as_str().unwrap_or_default().to_owned()
}

/// Extract an unsigned integer field, returning zero if missing or null.
fn json_u64(v: &Value, field: &str) -> u64 {
    v[field].as_u64().unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
