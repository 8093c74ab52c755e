//! Agentic streaming engine.
//!
//! Drives the multi-turn loop at the heart of every exchange: call a
//! provider through the router, watch the turn's events, dispatch any tool
//! requests, feed the results back, and repeat until a turn arrives with no
//! tool requests -- that turn's text is the final answer, delivered in full,
//! exactly once, through the outbound sink.
//!
//! Two invariants guard the user-visible output:
//!
//! - **Inter-tool suppression** -- text observed in a turn that requests
//!   tools is the model narrating its own plan ("I'll check your calendar
//!   now").  It is logged and never forwarded.
//! - **Final-reply dedup** -- every turn's text buffer is discarded when the
//!   turn completes; only the final turn's text reaches the sink.  Flushing
//!   a partial pre-tool sentence early and then appending the real answer is
//!   exactly the duplication bug this rules out.
//!
//! Tool failures never abort an exchange: each request in a batch is
//! dispatched independently, a failing tool is answered with a synthesized
//! error result, and the model decides how to react on its next turn.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use valet_kernel::{OutboundSink, UserId};

use crate::error::{AgentError, Result};
use crate::provider::{Message, ToolDefinition, ToolRequest, TurnEvent, TurnRequest};
use crate::router::{ModelRouter, RoutingCategory, approximate_tokens};
use crate::usage::TokenUsage;

// ---------------------------------------------------------------------------
// Tool executor contract
// ---------------------------------------------------------------------------

/// Executes side-effecting tools on the user's behalf.
///
/// Implemented by the tool registry (calendar, mail, file, search modules);
/// the engine only sees this trait.  `dispatch` must be safely callable
/// concurrently for different requests within the same turn; each tool
/// module is responsible for its own concurrency safety.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Definitions of every tool the model may request.
    fn schemas(&self) -> Vec<ToolDefinition>;

    /// Perform the side effect and return a textual result for the model.
    async fn dispatch(&self, tool_name: &str, arguments: Value, user_id: UserId)
    -> Result<String>;
}

// ---------------------------------------------------------------------------
// Exchange phase
// ---------------------------------------------------------------------------

/// Explicit state machine for one exchange.
///
/// Replaces the flag-discipline approach (an `in_tool_turn` boolean) with
/// transitions that are validated at runtime: an illegal transition is a
/// bug in the engine and fails loudly in debug builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePhase {
    /// Receiving model output for the current turn.
    StreamingText,
    /// At least one tool request has been observed in the current turn.
    ToolCallPending,
    /// The turn completed with tool requests; dispatch is underway.
    ToolExecuting,
    /// A tool in the batch failed; its error result was synthesized.
    ToolError,
    /// All results for the turn are assembled, in request order.
    ToolResultReady,
    /// The final turn arrived; its text is being delivered.
    Final,
    /// The exchange finished and its state may be discarded.
    Complete,
    /// Unrecoverable failure; the exchange is being torn down.
    Fatal,
}

impl ExchangePhase {
    /// Whether moving from `self` to `to` is a legal transition.
    fn can_transition(self, to: Self) -> bool {
        use ExchangePhase::*;
        if to == Fatal {
            return !matches!(self, Complete);
        }
        matches!(
            (self, to),
            (StreamingText, ToolCallPending)
                | (StreamingText, Final)
                | (ToolCallPending, ToolExecuting)
                | (ToolExecuting, ToolResultReady)
                | (ToolExecuting, ToolError)
                | (ToolError, ToolResultReady)
                | (ToolResultReady, StreamingText)
                | (Final, Complete)
        )
    }
}

/// Mutable state of one agentic loop run.
///
/// Owned exclusively by the engine invocation processing one exchange;
/// created at the start of a request and discarded at the end.  Durable
/// conversation history is a collaborator's responsibility.
struct ExchangeState {
    working_history: Vec<Message>,
    phase: ExchangePhase,
    accumulated_usage: TokenUsage,
}

impl ExchangeState {
    fn new(history: Vec<Message>) -> Self {
        Self {
            working_history: history,
            phase: ExchangePhase::StreamingText,
            accumulated_usage: TokenUsage::ZERO,
        }
    }

    /// Move to `to`, rejecting illegal transitions loudly.
    fn transition(&mut self, to: ExchangePhase) -> Result<()> {
        if !self.phase.can_transition(to) {
            tracing::error!(from = ?self.phase, to = ?to, "illegal exchange phase transition");
            debug_assert!(false, "illegal exchange phase transition: {:?} -> {to:?}", self.phase);
            return Err(AgentError::InvalidPhaseTransition {
                from: format!("{:?}", self.phase),
                to: format!("{to:?}"),
            });
        }
        tracing::trace!(from = ?self.phase, to = ?to, "exchange phase transition");
        self.phase = to;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Configuration for the agentic loop.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum model turns per exchange before failing loudly.
    pub max_turns: u32,

    /// Maximum tokens the model may generate per turn.
    pub max_tokens: u32,

    /// Hard wall-clock ceiling for one exchange, detached or not.
    pub exchange_ceiling: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_turns: 8,
            max_tokens: 4096,
            exchange_ceiling: Duration::from_secs(7_200),
        }
    }
}

/// Outcome of a completed exchange.
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    /// The final answer delivered to the user.
    pub final_text: String,

    /// Number of model turns used.
    pub turns_used: u32,

    /// Pointwise sum of every provider call's usage, fallback retries
    /// included (failed attempts contribute zero).
    pub usage: TokenUsage,

    /// The provider that served the final turn.
    pub provider: String,
}

/// Drives multi-turn tool-using exchanges.
pub struct AgenticStreamEngine {
    router: Arc<ModelRouter>,
    tools: Arc<dyn ToolExecutor>,
    sink: Arc<dyn OutboundSink>,
    config: EngineConfig,
}

impl AgenticStreamEngine {
    /// Create an engine over the given router, tool executor, and sink.
    pub fn new(
        router: Arc<ModelRouter>,
        tools: Arc<dyn ToolExecutor>,
        sink: Arc<dyn OutboundSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            router,
            tools,
            sink,
            config,
        }
    }

    /// Run one exchange to completion under the wall-clock ceiling.
    ///
    /// `history` is the working conversation (ending with the user's
    /// message).  The final answer is delivered through the sink before this
    /// returns.  Only [`AgentError::ProviderExhausted`] and
    /// [`AgentError::ExchangeTimeout`] among the returned errors are meant
    /// for user-visible rendering; see [`AgentError::user_notice`].
    pub async fn run(
        &self,
        user_id: UserId,
        history: Vec<Message>,
        system: Option<String>,
        category: RoutingCategory,
    ) -> Result<ExchangeOutcome> {
        self.run_with_ceiling(user_id, history, system, category, true)
            .await
    }

    /// Run one exchange without delivering the final answer.
    ///
    /// Used for detached exchanges, where the background task runner owns
    /// the one delivery per job -- the engine delivering too would duplicate
    /// the answer.  Everything else (loop, suppression, ceiling) is
    /// identical to [`run`](Self::run).
    pub async fn run_detached(
        &self,
        user_id: UserId,
        history: Vec<Message>,
        system: Option<String>,
        category: RoutingCategory,
    ) -> Result<ExchangeOutcome> {
        self.run_with_ceiling(user_id, history, system, category, false)
            .await
    }

    async fn run_with_ceiling(
        &self,
        user_id: UserId,
        history: Vec<Message>,
        system: Option<String>,
        category: RoutingCategory,
        deliver_final: bool,
    ) -> Result<ExchangeOutcome> {
        let ceiling = self.config.exchange_ceiling;
        match tokio::time::timeout(
            ceiling,
            self.run_inner(user_id, history, system, category, deliver_final),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                let ceiling_secs = ceiling.as_secs();
                tracing::error!(user_id, ceiling_secs, "exchange hit wall-clock ceiling");
                Err(AgentError::ExchangeTimeout { ceiling_secs })
            }
        }
    }

    async fn run_inner(
        &self,
        user_id: UserId,
        history: Vec<Message>,
        system: Option<String>,
        category: RoutingCategory,
        deliver_final: bool,
    ) -> Result<ExchangeOutcome> {
        let mut state = ExchangeState::new(history);
        let tool_schemas = self.tools.schemas();

        for turn_index in 0..self.config.max_turns {
            let request = TurnRequest {
                messages: state.working_history.clone(),
                system: system.clone(),
                tools: tool_schemas.clone(),
                max_tokens: self.config.max_tokens,
            };
            let approx_tokens = approximate_tokens(&request.messages, request.system.as_deref());

            tracing::debug!(
                user_id,
                turn = turn_index + 1,
                max_turns = self.config.max_turns,
                history_len = state.working_history.len(),
                "starting model turn"
            );

            let mut routed = match self
                .router
                .stream_with_fallback(&request, category, approx_tokens)
                .await
            {
                Ok(routed) => routed,
                Err(e) => {
                    state.transition(ExchangePhase::Fatal)?;
                    return Err(e);
                }
            };

            // Per-turn accumulation.  Nothing is forwarded until the turn
            // completes: only a turn with zero tool requests may speak.
            let mut turn_text = String::new();
            let mut turn_tools: Vec<ToolRequest> = Vec::new();
            let mut summary = None;

            while let Some(event) = routed.next_event().await {
                match event {
                    Ok(TurnEvent::TextChunk(chunk)) => {
                        if !turn_tools.is_empty() {
                            // Suppression invariant: narration between tool
                            // requests and turn completion stays internal.
                            tracing::debug!(
                                user_id,
                                chars = chunk.len(),
                                "suppressing inter-tool narration"
                            );
                        }
                        turn_text.push_str(&chunk);
                    }
                    Ok(TurnEvent::ToolRequest(tool_request)) => {
                        if turn_tools.is_empty() {
                            state.transition(ExchangePhase::ToolCallPending)?;
                        }
                        tracing::info!(
                            user_id,
                            tool = %tool_request.name,
                            tool_use_id = %tool_request.id,
                            "model requested tool"
                        );
                        turn_tools.push(tool_request);
                    }
                    Ok(TurnEvent::TurnComplete(s)) => {
                        summary = Some(s);
                        break;
                    }
                    Err(e) => {
                        state.transition(ExchangePhase::Fatal)?;
                        return Err(e);
                    }
                }
            }

            let Some(summary) = summary else {
                state.transition(ExchangePhase::Fatal)?;
                return Err(AgentError::ProviderTransport {
                    provider: routed.provider().to_owned(),
                    reason: "stream ended without turn completion".to_owned(),
                });
            };

            state.accumulated_usage += summary.usage;

            if turn_tools.is_empty() {
                // Final turn: this text, and only this text, goes out.
                state.transition(ExchangePhase::Final)?;
                let final_text = summary.text;
                state.working_history.push(Message::assistant(&final_text));

                if final_text.trim().is_empty() {
                    tracing::warn!(user_id, "final turn produced no text; nothing delivered");
                } else if deliver_final {
                    self.sink.send(user_id, &final_text).await?;
                }
                state.transition(ExchangePhase::Complete)?;

                tracing::info!(
                    user_id,
                    turns = turn_index + 1,
                    total_tokens = state.accumulated_usage.total(),
                    provider = routed.provider(),
                    "exchange complete"
                );
                return Ok(ExchangeOutcome {
                    final_text,
                    turns_used: turn_index + 1,
                    usage: state.accumulated_usage,
                    provider: routed.provider().to_owned(),
                });
            }

            // Tool turn: the buffered narration is discarded, never sent.
            if !turn_text.is_empty() {
                tracing::debug!(
                    user_id,
                    discarded_chars = turn_text.len(),
                    "discarding pre-tool narration buffer"
                );
            }

            state.transition(ExchangePhase::ToolExecuting)?;
            state
                .working_history
                .push(Message::assistant_tool_calls(summary.text, turn_tools.clone()));

            let results = self.execute_tools(user_id, &turn_tools).await;
            if results.iter().any(|r| r.is_error) {
                state.transition(ExchangePhase::ToolError)?;
            }
            state.transition(ExchangePhase::ToolResultReady)?;

            // Every request gets exactly one result, in request order, before
            // the next model call.
            for result in results {
                state
                    .working_history
                    .push(Message::tool_result(result.tool_use_id, result.content));
            }

            state.transition(ExchangePhase::StreamingText)?;
        }

        state.transition(ExchangePhase::Fatal)?;
        tracing::error!(
            user_id,
            max_turns = self.config.max_turns,
            "agentic loop exceeded turn limit"
        );
        Err(AgentError::MaxTurnsExceeded {
            max_turns: self.config.max_turns,
        })
    }

    /// Dispatch a turn's tool requests concurrently and reassemble the
    /// results in request order.
    ///
    /// Each dispatch is isolated: an executor error (or panic) becomes a
    /// synthesized error result and never aborts the batch.
    async fn execute_tools(&self, user_id: UserId, requests: &[ToolRequest]) -> Vec<ToolOutcome> {
        let mut handles = Vec::with_capacity(requests.len());

        for request in requests {
            let executor = Arc::clone(&self.tools);
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                match executor
                    .dispatch(&request.name, request.arguments.clone(), user_id)
                    .await
                {
                    Ok(content) => ToolOutcome {
                        tool_use_id: request.id,
                        content,
                        is_error: false,
                    },
                    Err(e) => {
                        tracing::warn!(
                            user_id,
                            tool = %request.name,
                            tool_use_id = %request.id,
                            arguments = %redact_arguments(&request.arguments),
                            error = %e,
                            "tool dispatch failed; synthesizing error result"
                        );
                        ToolOutcome {
                            tool_use_id: request.id,
                            content: format!("Tool '{}' failed: {e}", request.name),
                            is_error: true,
                        }
                    }
                }
            }));
        }

        // Await in issue order: completion order does not matter, pairing
        // order does.
        let mut results = Vec::with_capacity(requests.len());
        for (handle, request) in handles.into_iter().zip(requests) {
            match handle.await {
                Ok(outcome) => results.push(outcome),
                Err(join_error) => {
                    tracing::error!(
                        user_id,
                        tool = %request.name,
                        error = %join_error,
                        "tool task panicked; synthesizing error result"
                    );
                    results.push(ToolOutcome {
                        tool_use_id: request.id.clone(),
                        content: format!("Tool '{}' failed: internal error", request.name),
                        is_error: true,
                    });
                }
            }
        }
        results
    }
}

/// The outcome of one tool dispatch, success or synthesized error.
struct ToolOutcome {
    tool_use_id: String,
    content: String,
    is_error: bool,
}

/// Summarize tool arguments for logs without leaking their values: object
/// keys only.
fn redact_arguments(arguments: &Value) -> String {
    match arguments.as_object() {
        Some(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("{{{}}}", keys.join(", "))
        }
        None => "<non-object>".to_owned(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
