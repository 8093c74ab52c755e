//! Provider adapter for OpenAI-compatible Chat Completions APIs.
//!
//! One adapter covers every backend that speaks this dialect: both secondary
//! cloud providers and the local fallback model (which serves the same API
//! shape from a local port).  Instances differ only in name, base URL,
//! model, and credentials.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};
use crate::provider::openai_sse::ChatStreamAccumulator;
use crate::provider::{
    ProviderAdapter, Role, StopReason, TurnEvent, TurnRequest, TurnSender, TurnStream, TurnSummary,
};

/// HTTP client timeout; the exchange-level ceiling is enforced upstream.
const HTTP_TIMEOUT: Duration = Duration::from_secs(600);

/// Adapter for one Chat Completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiCompatAdapter {
    name: String,
    model: String,
    base_url: String,
    api_key: String,
    http: reqwest::Client,
}

impl OpenAiCompatAdapter {
    /// Create an adapter.  An empty `api_key` is allowed for local backends
    /// that do not authenticate.
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AgentError::Config {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            name: name.into(),
            model: model.into(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            http,
        })
    }

    /// Build the JSON body for the Chat Completions API.
    fn build_request_body(&self, request: &TurnRequest) -> Value {
        let messages = messages_to_wire(request);

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
            "stream": true,
            // Ask for usage on the final stream chunk; endpoints that do not
            // understand this option ignore it.
            "stream_options": {"include_usage": true},
        });

        if !request.tools.is_empty() {
            body["tools"] = json!(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.input_schema,
                            }
                        })
                    })
                    .collect::<Vec<_>>()
            );
        }

        body
    }

    /// Send the HTTP request and verify the response status.
    async fn send_request(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);

        let mut headers = HeaderMap::new();
        if !self.api_key.is_empty() {
            let auth_value = format!("Bearer {}", self.api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value).map_err(|e| AgentError::Config {
                    reason: format!("invalid authorization header: {e}"),
                })?,
            );
        }
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
impl ProviderAdapter for OpenAiCompatAdapter {
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

/// Read the SSE byte stream, forwarding text deltas as they arrive.
///
/// Tool-call arguments accumulate across chunks, so the assembled
/// [`TurnEvent::ToolRequest`]s are emitted when the stream finishes, just
/// before `TurnComplete` -- preserving the request-before-completion event
/// ordering the engine relies on.
async fn consume_stream(
    provider: &str,
    resp: reqwest::Response,
    tx: &TurnSender,
) -> Result<()> {
    let mut accumulator = ChatStreamAccumulator::new(provider);

    let mut byte_stream = resp.bytes_stream();
    let mut line_buffer = String::new();

    'read: while let Some(chunk_result) = byte_stream.next().await {
        let chunk = chunk_result.map_err(|e| AgentError::ProviderTransport {
            provider: provider.to_owned(),
            reason: format!("stream read error: {e}"),
        })?;

        let chunk_text = std::str::from_utf8(&chunk).map_err(|e| AgentError::StreamParse {
            provider: provider.to_owned(),
            reason: format!("invalid UTF-8 in stream: {e}"),
        })?;

        line_buffer.push_str(chunk_text);

        while let Some(newline_pos) = line_buffer.find('\n') {
            let line = line_buffer[..newline_pos].to_owned();
            line_buffer = line_buffer[newline_pos + 1..].to_owned();

            if let Some(delta_text) = accumulator.feed_line(&line)? {
                if !tx.emit(TurnEvent::TextChunk(delta_text)).await {
                    return Ok(()); // consumer dropped the stream
                }
            }

            if accumulator.is_done() {
                break 'read;
            }
        }
    }

    if !accumulator.is_done() {
        return Err(AgentError::ProviderTransport {
            provider: provider.to_owned(),
            reason: "stream ended without [DONE] sentinel".to_owned(),
        });
    }

    let finish_reason = accumulator.finish_reason().map(str::to_owned);
    let (text, tool_requests, usage) = accumulator.into_parts()?;

    for request in &tool_requests {
        if !tx.emit(TurnEvent::ToolRequest(request.clone())).await {
            return Ok(());
        }
    }

    let summary = TurnSummary {
        stop: StopReason::parse(finish_reason.as_deref(), !tool_requests.is_empty()),
        text,
        tool_requests,
        usage,
    };
    tx.emit(TurnEvent::TurnComplete(summary)).await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Wire format conversion
// ---------------------------------------------------------------------------

/// Convert the provider-agnostic history to Chat Completions messages.
///
/// The system prompt travels as the first message; tool requests become
/// `tool_calls` entries on assistant messages; tool results become
/// `role: "tool"` messages correlated by `tool_call_id`.
fn messages_to_wire(request: &TurnRequest) -> Vec<Value> {
    let mut wire: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        wire.push(json!({
            "role": "system",
            "content": system,
        }));
    }

    for msg in &request.messages {
        match msg.role {
            Role::System => wire.push(json!({
                "role": "system",
                "content": msg.content,
            })),

            Role::User => wire.push(json!({
                "role": "user",
                "content": msg.content,
            })),

            Role::Assistant => {
                if msg.tool_calls.is_empty() {
                    wire.push(json!({
                        "role": "assistant",
                        "content": msg.content,
                    }));
                } else {
                    wire.push(json!({
                        "role": "assistant",
                        "content": msg.content,
                        "tool_calls": msg
                            .tool_calls
                            .iter()
                            .map(|tc| {
                                json!({
                                    "id": tc.id,
                                    "type": "function",
                                    "function": {
                                        "name": tc.name,
                                        "arguments": tc.arguments.to_string(),
                                    }
                                })
                            })
                            .collect::<Vec<_>>(),
                    }));
                }
            }

            Role::Tool => wire.push(json!({
                "role": "tool",
                "tool_call_id": msg.tool_use_id.clone().unwrap_or_default(),
                "content": msg.content,
            })),
        }
    }

    wire
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
