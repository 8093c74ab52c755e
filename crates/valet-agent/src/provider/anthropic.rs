//! Provider adapter for the Anthropic-style Messages API.
//!
//! This is the primary cloud provider.  Requests are built in the Messages
//! wire format (system prompt as a top-level field, tool_use / tool_result
//! content blocks) and responses are consumed as an SSE stream parsed by
//! [`super::sse::SseParser`], with tool-call arguments assembled from
//! `input_json_delta` fragments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::provider::sse::{SseParser, WireDelta, WireEvent};
use crate::provider::{
    Message, ProviderAdapter, Role, StopReason, ToolRequest, TurnEvent, TurnRequest, TurnSender,
    TurnStream, TurnSummary,
};
use crate::usage::TokenUsage;

/// Messages API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// HTTP client timeout.  Generous because a single streamed turn can run for
/// minutes; the exchange-level wall-clock ceiling is enforced upstream.
const HTTP_TIMEOUT: Duration = Duration::from_secs(600);

/// Adapter for one Messages API endpoint.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    name: String,
    model: String,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl AnthropicAdapter {
    /// Create an adapter.  `name` is the routing/breaker identity
    /// (e.g. `"primary"`); `model` the model id to request.
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(AgentError::Config {
                reason: format!("provider `{name}` has an empty API key"),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AgentError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            name,
            model: model.into(),
            base_url: base_url.into(),
            api_key,
            http,
        })
    }

    /// Build the JSON body for the Messages API.
    fn build_request_body(&self, request: &TurnRequest) -> Value {
        let (system_text, messages) = messages_to_wire(&request.messages);

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
            "stream": true,
        });

        // An explicit system prompt on the request wins; otherwise any
        // system-role messages folded out of the history are used.
        if let Some(system) = request.system.as_deref().or(system_text.as_deref()) {
            body["system"] = json!(system);
        }

        if !request.tools.is_empty() {
            body["tools"] = json!(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.input_schema,
                        })
                    })
                    .collect::<Vec<_>>()
            );
        }

        body
    }

    /// Send the HTTP request and verify the response status.
    async fn send_request(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.base_url);

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key).map_err(|e| AgentError::Config {
                reason: format!("invalid API key header: {e}"),
            })?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::debug!(
            url = %url,
            provider = %self.name,
            model = %self.model,
            "sending provider request"
        );

        let resp = self
            .http
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::ProviderTransport {
                provider: self.name.clone(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(super::classify_http_failure(&self.name, status, &text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_turn(&self, request: &TurnRequest) -> Result<TurnStream> {
        let body = self.build_request_body(request);
        let resp = self.send_request(&body).await?;

        let (tx, stream) = TurnStream::channel();
        let provider = self.name.clone();
        tokio::spawn(async move {
            if let Err(e) = consume_stream(&provider, resp, &tx).await {
                tx.fail(e).await;
            }
        });

        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Stream consumption
// ---------------------------------------------------------------------------

/// In-progress tool request being assembled from `input_json_delta`s.
#[derive(Debug, Default)]
struct ToolUseBuilder {
    id: String,
    name: String,
    input_json: String,
}

/// Read the SSE byte stream and translate wire events into turn events.
async fn consume_stream(
    provider: &str,
    resp: reqwest::Response,
    tx: &TurnSender,
) -> Result<()> {
    let mut parser = SseParser::new(provider);

    let mut text = String::new();
    let mut builders: HashMap<u32, ToolUseBuilder> = HashMap::new();
    let mut tool_requests: Vec<ToolRequest> = Vec::new();
    let mut usage = TokenUsage::ZERO;
    let mut stop_reason: Option<String> = None;

    let mut byte_stream = resp.bytes_stream();
    let mut line_buffer = String::new();

    while let Some(chunk_result) = byte_stream.next().await {
        let chunk = chunk_result.map_err(|e| AgentError::ProviderTransport {
            provider: provider.to_owned(),
            reason: format!("stream read error: {e}"),
        })?;

        let chunk_text =
            std::str::from_utf8(&chunk).map_err(|e| AgentError::StreamParse {
                provider: provider.to_owned(),
                reason: format!("invalid UTF-8 in stream: {e}"),
            })?;

        line_buffer.push_str(chunk_text);

        while let Some(newline_pos) = line_buffer.find('\n') {
            let line = line_buffer[..newline_pos].to_owned();
            line_buffer = line_buffer[newline_pos + 1..].to_owned();

            let Some(event) = parser.parse_line(&line)? else {
                continue;
            };

            match event {
                WireEvent::MessageStart {
                    input_tokens,
                    cache_creation_tokens,
                    cache_read_tokens,
                    ..
                } => {
                    usage.input_tokens = input_tokens;
                    usage.cache_creation_tokens = cache_creation_tokens;
                    usage.cache_read_tokens = cache_read_tokens;
                }

                WireEvent::ContentBlockStart {
                    index,
                    content_type,
                    id,
                    name,
                } => {
                    if content_type == "tool_use" {
                        builders.insert(
                            index,
                            ToolUseBuilder {
                                id: id.unwrap_or_default(),
                                name: name.unwrap_or_default(),
                                input_json: String::new(),
                            },
                        );
                    }
                }

                WireEvent::ContentBlockDelta { index, delta } => match delta {
                    WireDelta::TextDelta(t) => {
                        text.push_str(&t);
                        if !tx.emit(TurnEvent::TextChunk(t)).await {
                            return Ok(()); // consumer dropped the stream
                        }
                    }
                    WireDelta::InputJsonDelta(j) => {
                        if let Some(builder) = builders.get_mut(&index) {
                            builder.input_json.push_str(&j);
                        }
                    }
                },

                WireEvent::ContentBlockStop { index } => {
                    if let Some(builder) = builders.remove(&index) {
                        let request = finish_tool_request(provider, builder)?;
                        tool_requests.push(request.clone());
                        if !tx.emit(TurnEvent::ToolRequest(request)).await {
                            return Ok(());
                        }
                    }
                }

                WireEvent::MessageDelta {
                    stop_reason: reason,
                    output_tokens,
                } => {
                    stop_reason = reason;
                    usage.output_tokens = output_tokens;
                }

                WireEvent::MessageStop => {
                    let summary = TurnSummary {
                        stop: StopReason::parse(stop_reason.as_deref(), !tool_requests.is_empty()),
                        text,
                        tool_requests,
                        usage,
                    };
                    tx.emit(TurnEvent::TurnComplete(summary)).await;
                    return Ok(());
                }

                WireEvent::Ping => {}
            }
        }
    }

    Err(AgentError::ProviderTransport {
        provider: provider.to_owned(),
        reason: "stream ended without message_stop".to_owned(),
    })
}

/// Parse an assembled tool_use block into a [`ToolRequest`].
fn finish_tool_request(provider: &str, builder: ToolUseBuilder) -> Result<ToolRequest> {
    let arguments: Value = if builder.input_json.is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(&builder.input_json).map_err(|e| AgentError::StreamParse {
            provider: provider.to_owned(),
            reason: format!("invalid JSON in tool `{}` input: {e}", builder.name),
        })?
    };

    Ok(ToolRequest {
        id: builder.id,
        name: builder.name,
        arguments,
    })
}

// ---------------------------------------------------------------------------
// Wire format conversion
// ---------------------------------------------------------------------------

/// Split system messages out (the Messages API expects them as a top-level
/// field) and convert the rest of the history to wire messages.
///
/// Consecutive [`Role::Tool`] messages are folded into a single user message
/// carrying multiple `tool_result` blocks, which is how the API expects the
/// results of a multi-tool turn to arrive.
fn messages_to_wire(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());
    let mut pending_results: Vec<Value> = Vec::new();

    let flush_results = |wire: &mut Vec<Value>, pending: &mut Vec<Value>| {
        if !pending.is_empty() {
            wire.push(json!({
                "role": "user",
                "content": std::mem::take(pending),
            }));
        }
    };

    for msg in messages {
        match msg.role {
            Role::System => match &mut system {
                Some(existing) => {
                    existing.push('\n');
                    existing.push_str(&msg.content);
                }
                None => system = Some(msg.content.clone()),
            },

            Role::User => {
                flush_results(&mut wire, &mut pending_results);
                wire.push(json!({
                    "role": "user",
                    "content": msg.content,
                }));
            }

            Role::Assistant => {
                flush_results(&mut wire, &mut pending_results);
                if msg.tool_calls.is_empty() {
                    wire.push(json!({
                        "role": "assistant",
                        "content": msg.content,
                    }));
                } else {
                    let mut content: Vec<Value> = Vec::new();
                    if !msg.content.is_empty() {
                        content.push(json!({
                            "type": "text",
                            "text": msg.content,
                        }));
                    }
                    for tc in &msg.tool_calls {
                        content.push(json!({
                            "type": "tool_use",
                            "id": tc.id,
                            "name": tc.name,
                            "input": tc.arguments,
                        }));
                    }
                    wire.push(json!({
                        "role": "assistant",
                        "content": content,
                    }));
                }
            }

            Role::Tool => {
                pending_results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_use_id.clone().unwrap_or_default(),
                    "content": msg.content,
                }));
            }
        }
    }
    flush_results(&mut wire, &mut pending_results);

    (system, wire)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
