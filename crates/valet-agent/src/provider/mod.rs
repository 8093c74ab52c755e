//! Provider adapters and the types flowing through them.
//!
//! A provider is one backend capable of answering a model request: the
//! primary cloud service, a secondary cloud service, or the local fallback
//! model.  Every backend is wrapped in a [`ProviderAdapter`] that exposes the
//! same streaming shape, so the router and engine never see wire formats.
//!
//! The message types are provider-agnostic at this layer; the
//! [`anthropic`] and [`openai`] modules translate them into their respective
//! wire formats.

pub mod anthropic;
pub mod openai;
pub mod openai_sse;
pub mod sse;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::usage::TokenUsage;

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// Input from the end user.
    User,
    /// Output from the model.
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

/// A single message in an exchange's working history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Who produced this message.
    pub role: Role,

    /// The textual content of the message.
    ///
    /// For [`Role::Tool`] messages this is the tool's result (or the
    /// synthesized error string).  For [`Role::Assistant`] messages that
    /// contain only tool requests, this may be empty.
    #[serde(default)]
    pub content: String,

    /// Tool invocations requested by the assistant (only present when
    /// `role == Role::Assistant`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolRequest>,

    /// Identifies which tool request this message answers (only present
    /// when `role == Role::Tool`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
}

impl Message {
    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_use_id: None,
        }
    }

    /// Create an assistant text message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_use_id: None,
        }
    }

    /// Create an assistant message carrying tool requests alongside any
    /// narration text the model produced in the same turn.
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolRequest>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_use_id: None,
        }
    }

    /// Create a tool result message answering `tool_use_id`.
    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_use_id: Some(tool_use_id.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Tools
// ---------------------------------------------------------------------------

/// A tool definition exposed to the model so it knows what it may invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name.
    pub name: String,

    /// Human-readable description of what the tool does.
    pub description: String,

    /// JSON Schema describing the tool's input parameters.
    pub input_schema: Value,
}

/// A tool invocation requested by the model during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Identifier assigned by the provider for correlating the result.
    pub id: String,

    /// The name of the tool to invoke.
    pub name: String,

    /// Arguments as a JSON value; structure depends on the tool's schema.
    pub arguments: Value,
}

// ---------------------------------------------------------------------------
// Turn request
// ---------------------------------------------------------------------------

/// One request to a provider: the working history plus tool schemas.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Conversation history, oldest first.
    pub messages: Vec<Message>,

    /// System prompt, sent out-of-band where the wire format wants it.
    pub system: Option<String>,

    /// Tools the model may request during this turn.
    pub tools: Vec<ToolDefinition>,

    /// Maximum tokens the model may generate in this turn.
    pub max_tokens: u32,
}

// ---------------------------------------------------------------------------
// Turn events
// ---------------------------------------------------------------------------

/// Why the provider ended the turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The model finished its answer.
    EndTurn,
    /// The model wants tool results before continuing.
    ToolUse,
    /// The response was cut off at the token ceiling.
    MaxTokens,
    /// Any other provider-reported reason, carried verbatim.
    Other(String),
}

impl StopReason {
    /// Map a provider-reported stop reason string onto the enum.
    pub fn parse(raw: Option<&str>, has_tool_requests: bool) -> Self {
        match raw {
            Some("end_turn") | Some("stop") => Self::EndTurn,
            Some("tool_use") | Some("tool_calls") => Self::ToolUse,
            Some("max_tokens") | Some("length") => Self::MaxTokens,
            Some(other) => Self::Other(other.to_owned()),
            // Some endpoints omit the reason; infer it from the content.
            None if has_tool_requests => Self::ToolUse,
            None => Self::EndTurn,
        }
    }
}

/// Everything known about a turn once its stream has finished.
#[derive(Debug, Clone)]
pub struct TurnSummary {
    /// Why the turn ended.
    pub stop: StopReason,

    /// The full text of the turn (concatenation of all text chunks).
    pub text: String,

    /// Tool requests issued during the turn, in issue order.
    pub tool_requests: Vec<ToolRequest>,

    /// Token usage for this single provider call.
    pub usage: TokenUsage,
}

/// An event observed while streaming one turn from a provider.
///
/// Every [`TurnEvent::ToolRequest`] precedes the [`TurnEvent::TurnComplete`]
/// of its turn, and `TurnComplete` is always the final event of a
/// successful stream.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// A partial text delta.
    TextChunk(String),

    /// The model requested a tool invocation (arguments fully assembled).
    ToolRequest(ToolRequest),

    /// The turn finished; carries the aggregate view and usage.
    TurnComplete(TurnSummary),
}

// ---------------------------------------------------------------------------
// Turn stream
// ---------------------------------------------------------------------------

/// Buffer size for in-flight turn events.
const TURN_CHANNEL_CAPACITY: usize = 64;

/// Ordered stream of [`TurnEvent`]s for one provider call.
///
/// Backed by an mpsc channel filled by the adapter's reader task; dropping
/// the stream aborts the reader's sends and thereby the call.
#[derive(Debug)]
pub struct TurnStream {
    rx: mpsc::Receiver<Result<TurnEvent>>,
}

impl TurnStream {
    /// Create a connected (sender, stream) pair.
    pub fn channel() -> (TurnSender, TurnStream) {
        let (tx, rx) = mpsc::channel(TURN_CHANNEL_CAPACITY);
        (TurnSender { tx }, TurnStream { rx })
    }

    /// Receive the next event; `None` once the stream is exhausted.
    pub async fn next_event(&mut self) -> Option<Result<TurnEvent>> {
        self.rx.recv().await
    }
}

/// Producer half of a [`TurnStream`], used by adapter reader tasks.
#[derive(Debug, Clone)]
pub struct TurnSender {
    tx: mpsc::Sender<Result<TurnEvent>>,
}

impl TurnSender {
    /// Push an event; returns `false` when the consumer is gone, which the
    /// reader task treats as a signal to stop.
    pub async fn emit(&self, event: TurnEvent) -> bool {
        self.tx.send(Ok(event)).await.is_ok()
    }

    /// Push a terminal error onto the stream.
    pub async fn fail(&self, error: crate::error::AgentError) {
        let _ = self.tx.send(Err(error)).await;
    }
}

// ---------------------------------------------------------------------------
// HTTP failure classification
// ---------------------------------------------------------------------------

/// Map a non-success HTTP status from a provider onto the error taxonomy.
///
/// 401/403 indicate misconfigured credentials and are reported as auth
/// failures (logged at error severity by the router); everything else --
/// rate limits, overload, server errors -- is a transport failure.  Both are
/// recoverable by falling back to the next candidate.
pub(crate) fn classify_http_failure(
    provider: &str,
    status: reqwest::StatusCode,
    body: &str,
) -> crate::error::AgentError {
    let reason = format!("HTTP {status}: {}", truncate(body, 300));
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        crate::error::AgentError::ProviderAuth {
            provider: provider.to_owned(),
            reason,
        }
    } else {
        crate::error::AgentError::ProviderTransport {
            provider: provider.to_owned(),
            reason,
        }
    }
}

/// Truncate `s` to at most `max` bytes on a char boundary.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ---------------------------------------------------------------------------
// Adapter contract
// ---------------------------------------------------------------------------

/// Uniform streaming interface over one concrete model backend.
///
/// Connect, auth, and rate-limit failures surface as `Err` from
/// [`stream_turn`](Self::stream_turn) before any event is produced; failures
/// after the stream has started arrive as an `Err` item on the stream.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider name used for routing, circuit breaking, and logs.
    fn name(&self) -> &str;

    /// The model identifier this adapter targets.
    fn model(&self) -> &str;

    /// Start streaming one turn.
    async fn stream_turn(&self, request: &TurnRequest) -> Result<TurnStream>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_parsing_covers_both_wire_dialects() {
        assert_eq!(StopReason::parse(Some("end_turn"), false), StopReason::EndTurn);
        assert_eq!(StopReason::parse(Some("stop"), false), StopReason::EndTurn);
        assert_eq!(StopReason::parse(Some("tool_use"), true), StopReason::ToolUse);
        assert_eq!(StopReason::parse(Some("tool_calls"), true), StopReason::ToolUse);
        assert_eq!(StopReason::parse(Some("max_tokens"), false), StopReason::MaxTokens);
        assert_eq!(StopReason::parse(Some("length"), false), StopReason::MaxTokens);
        assert_eq!(
            StopReason::parse(Some("content_filter"), false),
            StopReason::Other("content_filter".to_owned())
        );
    }

    #[test]
    fn missing_stop_reason_is_inferred_from_content() {
        assert_eq!(StopReason::parse(None, true), StopReason::ToolUse);
        assert_eq!(StopReason::parse(None, false), StopReason::EndTurn);
    }

    #[tokio::test]
    async fn turn_stream_preserves_order() {
        let (tx, mut stream) = TurnStream::channel();

        tokio::spawn(async move {
            tx.emit(TurnEvent::TextChunk("a".into())).await;
            tx.emit(TurnEvent::TextChunk("b".into())).await;
        });

        match stream.next_event().await.unwrap().unwrap() {
            TurnEvent::TextChunk(t) => assert_eq!(t, "a"),
            other => panic!("unexpected event: {other:?}"),
        }
        match stream.next_event().await.unwrap().unwrap() {
            TurnEvent::TextChunk(t) => assert_eq!(t, "b"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(stream.next_event().await.is_none());
    }

    #[test]
    fn message_constructors_set_roles() {
        let m = Message::tool_result("toolu_1", "ok");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_use_id.as_deref(), Some("toolu_1"));

        let m = Message::assistant_tool_calls(
            "checking",
            vec![ToolRequest {
                id: "toolu_2".into(),
                name: "calendar_list".into(),
                arguments: serde_json::json!({}),
            }],
        );
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.tool_calls.len(), 1);
    }
}
