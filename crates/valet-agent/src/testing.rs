//! Scripted fakes shared by the router, engine, and service test suites.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use valet_kernel::{AckHandle, OutboundSink, UserId};

use crate::engine::ToolExecutor;
use crate::error::AgentError;
use crate::provider::{
    ProviderAdapter, StopReason, ToolDefinition, ToolRequest, TurnEvent, TurnRequest, TurnStream,
    TurnSummary,
};
use crate::usage::TokenUsage;

/// Install a test subscriber once so `RUST_LOG=debug cargo test` shows
/// engine traces.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a tool-free turn summary ending the exchange.
pub(crate) fn text_summary(text: &str, usage: TokenUsage) -> TurnSummary {
    TurnSummary {
        stop: StopReason::EndTurn,
        text: text.to_owned(),
        tool_requests: Vec::new(),
        usage,
    }
}

/// Build a tool-use turn summary.
pub(crate) fn tool_summary(
    text: &str,
    tool_requests: Vec<ToolRequest>,
    usage: TokenUsage,
) -> TurnSummary {
    TurnSummary {
        stop: StopReason::ToolUse,
        text: text.to_owned(),
        tool_requests,
        usage,
    }
}

/// One scripted provider call outcome.
enum Outcome {
    /// Fail before any event (connect / auth / rate limit).
    ConnectError(AgentError),
    /// Produce these events, then end the stream.
    Events(Vec<TurnEvent>),
    /// Produce these events, then fail mid-stream.
    EventsThenError(Vec<TurnEvent>, AgentError),
    /// Produce these events, then stall until the consumer gives up.
    EventsThenHang(Vec<TurnEvent>),
}

/// A [`ProviderAdapter`] that replays a queued script, one outcome per call,
/// and records every request it receives.
pub(crate) struct ScriptedProvider {
    name: String,
    model: String,
    script: Mutex<VecDeque<Outcome>>,
    requests: Mutex<Vec<TurnRequest>>,
    calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            model: model.into(),
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of calls attempted against this provider.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received, in call order.
    pub fn received(&self) -> Vec<TurnRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn fail_next_connect(&self, reason: &str) {
        self.push(Outcome::ConnectError(AgentError::ProviderTransport {
            provider: self.name.clone(),
            reason: reason.to_owned(),
        }));
    }

    pub fn fail_next_auth(&self, reason: &str) {
        self.push(Outcome::ConnectError(AgentError::ProviderAuth {
            provider: self.name.clone(),
            reason: reason.to_owned(),
        }));
    }

    /// Script a call that streams the summary's text as one chunk, emits its
    /// tool requests, and completes.
    pub fn succeed_next(&self, summary: TurnSummary) {
        let mut events = Vec::new();
        if !summary.text.is_empty() {
            events.push(TurnEvent::TextChunk(summary.text.clone()));
        }
        for request in &summary.tool_requests {
            events.push(TurnEvent::ToolRequest(request.clone()));
        }
        events.push(TurnEvent::TurnComplete(summary));
        self.push(Outcome::Events(events));
    }

    /// Script a call with an explicit event sequence.
    pub fn enqueue_events(&self, events: Vec<TurnEvent>) {
        self.push(Outcome::Events(events));
    }

    /// Script a call that fails after streaming `events`.
    pub fn enqueue_events_then_error(&self, events: Vec<TurnEvent>, reason: &str) {
        self.push(Outcome::EventsThenError(
            events,
            AgentError::ProviderTransport {
                provider: self.name.clone(),
                reason: reason.to_owned(),
            },
        ));
    }

    /// Script a call that streams `events` and then never completes.
    pub fn enqueue_events_then_hang(&self, events: Vec<TurnEvent>) {
        self.push(Outcome::EventsThenHang(events));
    }

    fn push(&self, outcome: Outcome) {
        self.script.lock().unwrap().push_back(outcome);
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn stream_turn(&self, request: &TurnRequest) -> crate::error::Result<TurnStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| {
                Outcome::ConnectError(AgentError::ProviderTransport {
                    provider: self.name.clone(),
                    reason: "script exhausted".to_owned(),
                })
            });

        match outcome {
            Outcome::ConnectError(e) => Err(e),
            Outcome::Events(events) => {
                let (tx, stream) = TurnStream::channel();
                tokio::spawn(async move {
                    for event in events {
                        if !tx.emit(event).await {
                            return;
                        }
                    }
                });
                Ok(stream)
            }
            Outcome::EventsThenError(events, error) => {
                let (tx, stream) = TurnStream::channel();
                tokio::spawn(async move {
                    for event in events {
                        if !tx.emit(event).await {
                            return;
                        }
                    }
                    tx.fail(error).await;
                });
                Ok(stream)
            }
            Outcome::EventsThenHang(events) => {
                let (tx, stream) = TurnStream::channel();
                tokio::spawn(async move {
                    for event in events {
                        if !tx.emit(event).await {
                            return;
                        }
                    }
                    // Hold the sender open so the stream never ends.
                    std::future::pending::<()>().await;
                });
                Ok(stream)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scripted tool executor
// ---------------------------------------------------------------------------

enum ToolBehavior {
    Succeed(String),
    SucceedAfter(Duration, String),
    Fail(String),
}

/// A [`ToolExecutor`] with per-tool scripted behavior.  Tools without a
/// script succeed with `"ok"`.
#[derive(Default)]
pub(crate) struct ScriptedExecutor {
    behaviors: Mutex<HashMap<String, ToolBehavior>>,
    dispatched: Mutex<Vec<(String, Value)>>,
}

impl ScriptedExecutor {
    pub fn succeed(&self, tool: &str, result: &str) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(tool.to_owned(), ToolBehavior::Succeed(result.to_owned()));
    }

    pub fn succeed_after(&self, tool: &str, delay: Duration, result: &str) {
        self.behaviors.lock().unwrap().insert(
            tool.to_owned(),
            ToolBehavior::SucceedAfter(delay, result.to_owned()),
        );
    }

    pub fn fail(&self, tool: &str, reason: &str) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(tool.to_owned(), ToolBehavior::Fail(reason.to_owned()));
    }

    /// Tool dispatches observed, in dispatch order.
    pub fn dispatched(&self) -> Vec<(String, Value)> {
        self.dispatched.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolExecutor for ScriptedExecutor {
    fn schemas(&self) -> Vec<ToolDefinition> {
        self.behaviors
            .lock()
            .unwrap()
            .keys()
            .map(|name| ToolDefinition {
                name: name.clone(),
                description: format!("test tool {name}"),
                input_schema: serde_json::json!({"type": "object"}),
            })
            .collect()
    }

    async fn dispatch(
        &self,
        tool_name: &str,
        arguments: Value,
        _user_id: UserId,
    ) -> crate::error::Result<String> {
        self.dispatched
            .lock()
            .unwrap()
            .push((tool_name.to_owned(), arguments));

        let behavior = {
            let behaviors = self.behaviors.lock().unwrap();
            match behaviors.get(tool_name) {
                Some(ToolBehavior::Succeed(result)) => ToolBehavior::Succeed(result.clone()),
                Some(ToolBehavior::SucceedAfter(delay, result)) => {
                    ToolBehavior::SucceedAfter(*delay, result.clone())
                }
                Some(ToolBehavior::Fail(reason)) => ToolBehavior::Fail(reason.clone()),
                None => ToolBehavior::Succeed("ok".to_owned()),
            }
        };

        match behavior {
            ToolBehavior::Succeed(result) => Ok(result),
            ToolBehavior::SucceedAfter(delay, result) => {
                tokio::time::sleep(delay).await;
                Ok(result)
            }
            ToolBehavior::Fail(reason) => Err(AgentError::ToolExecutionFailed {
                tool_name: tool_name.to_owned(),
                reason,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

/// An [`OutboundSink`] that records every delivery.
#[derive(Default)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<(UserId, String)>>,
    acks: Mutex<Vec<(UserId, String)>>,
}

impl RecordingSink {
    /// Messages delivered via `send`, in order.
    pub fn sent(&self) -> Vec<(UserId, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Acknowledgments delivered, in order.
    pub fn acks(&self) -> Vec<(UserId, String)> {
        self.acks.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundSink for RecordingSink {
    async fn send(&self, user_id: UserId, text: &str) -> valet_kernel::Result<()> {
        self.sent.lock().unwrap().push((user_id, text.to_owned()));
        Ok(())
    }

    async fn send_acknowledgment(
        &self,
        user_id: UserId,
        text: &str,
    ) -> valet_kernel::Result<AckHandle> {
        self.acks.lock().unwrap().push((user_id, text.to_owned()));
        Ok(AckHandle {
            user_id,
            message_id: None,
        })
    }
}
