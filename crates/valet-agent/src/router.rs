//! Model router.
//!
//! Routes each request to an ordered list of provider candidates based on
//! its routing category and approximate context size, then drives a
//! streaming call down that list: candidates whose circuit is open are
//! skipped, failed attempts are recorded against the circuit breaker and the
//! next candidate is tried, and the first candidate to produce an event wins
//! the call.  The candidate ordering itself is configuration, not logic --
//! every effective list ends at the local fallback model.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreaker;
use crate::error::{AgentError, Result};
use crate::provider::{Message, ProviderAdapter, TurnEvent, TurnRequest, TurnStream};

// ---------------------------------------------------------------------------
// Routing category
// ---------------------------------------------------------------------------

/// Coarse classification of a request, produced by an upstream classifier
/// and recomputed per request.  Drives candidate ordering only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingCategory {
    /// Short everyday requests.
    Routine,
    /// Condensing documents or conversations.
    Summarization,
    /// Multi-step analysis.
    Reasoning,
    /// Code reading or writing.
    Coding,
    /// Anything safety-sensitive.
    Safety,
    /// Tone/personality-heavy chat.
    Persona,
    /// The classifier could not decide.
    Unknown,
}

impl std::fmt::Display for RoutingCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Routine => "routine",
            Self::Summarization => "summarization",
            Self::Reasoning => "reasoning",
            Self::Coding => "coding",
            Self::Safety => "safety",
            Self::Persona => "persona",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Rough token estimate for a message history (characters / 4).
///
/// Only used to compare against the routing table's context threshold, so
/// precision does not matter.
pub fn approximate_tokens(messages: &[Message], system: Option<&str>) -> u64 {
    let chars: usize = messages.iter().map(|m| m.content.len()).sum::<usize>()
        + system.map(str::len).unwrap_or(0);
    (chars / 4) as u64
}

// ---------------------------------------------------------------------------
// Routing table
// ---------------------------------------------------------------------------

/// Candidate ordering for one category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutePlan {
    /// Provider names in preference order.
    pub providers: Vec<String>,

    /// Alternative ordering used once the context estimate exceeds
    /// [`RoutePlan::context_threshold_tokens`] (promotes the request to a
    /// higher-capacity provider).
    #[serde(default)]
    pub large_context: Option<Vec<String>>,

    /// Token estimate above which `large_context` applies.
    #[serde(default)]
    pub context_threshold_tokens: Option<u64>,
}

/// Static mapping from category (and context size) to candidate ordering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingTable {
    /// Per-category plans.  Categories without a plan use the
    /// [`RoutingCategory::Unknown`] plan.
    pub routes: HashMap<RoutingCategory, RoutePlan>,

    /// The local fallback provider every effective list ends with.
    pub fallback_provider: String,
}

impl RoutingTable {
    /// Candidate provider names for a request, ending at the local fallback.
    pub fn candidates(&self, category: RoutingCategory, approx_tokens: u64) -> Vec<String> {
        let plan = self
            .routes
            .get(&category)
            .or_else(|| self.routes.get(&RoutingCategory::Unknown));

        let mut names: Vec<String> = match plan {
            Some(plan) => {
                let over_threshold = plan
                    .context_threshold_tokens
                    .is_some_and(|threshold| approx_tokens > threshold);
                match (&plan.large_context, over_threshold) {
                    (Some(large), true) => large.clone(),
                    _ => plan.providers.clone(),
                }
            }
            None => Vec::new(),
        };

        if names.last() != Some(&self.fallback_provider) {
            names.retain(|n| n != &self.fallback_provider);
            names.push(self.fallback_provider.clone());
        }
        names
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Routes requests across the provider fleet with circuit-breaker gating
/// and automatic fallback.
pub struct ModelRouter {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    table: RoutingTable,
    breaker: Arc<CircuitBreaker>,

    /// Last provider that served a call, for observability only -- it has no
    /// effect on routing decisions.
    last_used: RwLock<Option<String>>,
}

impl ModelRouter {
    /// Create a router over `adapters`.  Fails if the table references a
    /// provider that was not supplied.
    pub fn new(
        adapters: Vec<Arc<dyn ProviderAdapter>>,
        table: RoutingTable,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self> {
        let adapters: HashMap<String, Arc<dyn ProviderAdapter>> = adapters
            .into_iter()
            .map(|a| (a.name().to_owned(), a))
            .collect();

        let mut referenced: Vec<&String> = vec![&table.fallback_provider];
        for plan in table.routes.values() {
            referenced.extend(plan.providers.iter());
            if let Some(large) = &plan.large_context {
                referenced.extend(large.iter());
            }
        }
        for name in referenced {
            if !adapters.contains_key(name) {
                return Err(AgentError::Config {
                    reason: format!("routing table references unknown provider `{name}`"),
                });
            }
        }

        Ok(Self {
            adapters,
            table,
            breaker,
            last_used: RwLock::new(None),
        })
    }

    /// Ordered candidate adapters for a request.
    pub fn route(
        &self,
        category: RoutingCategory,
        approx_tokens: u64,
    ) -> Vec<Arc<dyn ProviderAdapter>> {
        self.table
            .candidates(category, approx_tokens)
            .iter()
            .filter_map(|name| self.adapters.get(name).cloned())
            .collect()
    }

    /// The provider that served the most recent successful call, for
    /// observability.
    pub fn last_used(&self) -> Option<String> {
        self.last_used.read().expect("last_used lock poisoned").clone()
    }

    /// The breaker registry shared across all exchanges.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Drive one streaming call down the fallback chain.
    ///
    /// Candidates with an open circuit are skipped without being charged
    /// latency.  An attempt commits on its first received event: failures up
    /// to that point record a circuit failure and move on to the next
    /// candidate; no candidate is attempted more than once per call.  When
    /// every candidate is skipped or fails, the call fails with
    /// [`AgentError::ProviderExhausted`].
    pub async fn stream_with_fallback(
        &self,
        request: &TurnRequest,
        category: RoutingCategory,
        approx_tokens: u64,
    ) -> Result<RoutedTurn> {
        let candidates = self.route(category, approx_tokens);
        tracing::info!(
            %category,
            approx_tokens,
            candidates = ?candidates.iter().map(|a| a.name()).collect::<Vec<_>>(),
            "routing request"
        );

        let mut attempts = 0usize;
        let mut last_error: Option<AgentError> = None;

        for adapter in &candidates {
            let name = adapter.name();

            if !self.breaker.allow(name) {
                tracing::debug!(provider = name, "skipping provider: circuit open");
                continue;
            }

            attempts += 1;
            let fallback_used = attempts > 1;
            // The latency clock starts immediately before the call; time
            // spent in skipped candidates is never counted.
            let started_at = Instant::now();

            match adapter.stream_turn(request).await {
                Ok(mut stream) => match stream.next_event().await {
                    Some(Ok(first)) => {
                        self.breaker.record_success(name);
                        let label = format!("{}:{}", name, adapter.model());
                        *self.last_used.write().expect("last_used lock poisoned") =
                            Some(label);
                        tracing::info!(
                            provider = name,
                            model = adapter.model(),
                            first_byte_ms = started_at.elapsed().as_millis() as u64,
                            fallback = fallback_used,
                            "provider committed"
                        );
                        return Ok(RoutedTurn {
                            provider: name.to_owned(),
                            model: adapter.model().to_owned(),
                            category,
                            fallback_used,
                            breaker: Arc::clone(&self.breaker),
                            pending_first: Some(first),
                            stream,
                            started_at,
                        });
                    }
                    Some(Err(e)) => {
                        self.note_attempt_failure(name, &e);
                        last_error = Some(e);
                    }
                    None => {
                        let e = AgentError::ProviderTransport {
                            provider: name.to_owned(),
                            reason: "stream ended before first event".to_owned(),
                        };
                        self.note_attempt_failure(name, &e);
                        last_error = Some(e);
                    }
                },
                Err(e) => {
                    self.note_attempt_failure(name, &e);
                    last_error = Some(e);
                }
            }
        }

        let last_error = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "every candidate's circuit is open".to_owned());
        tracing::error!(%category, attempts, last_error = %last_error, "provider fallback chain exhausted");
        Err(AgentError::ProviderExhausted {
            category: category.to_string(),
            attempts,
            last_error,
        })
    }

    /// Record a failed attempt against the breaker and log it.  Auth
    /// failures log at error severity since they indicate misconfiguration.
    fn note_attempt_failure(&self, provider: &str, error: &AgentError) {
        self.breaker.record_failure(provider);
        match error {
            AgentError::ProviderAuth { .. } => {
                tracing::error!(provider, error = %error, "provider attempt failed (auth)");
            }
            _ => {
                tracing::warn!(provider, error = %error, "provider attempt failed; trying next");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Routed turn
// ---------------------------------------------------------------------------

/// A committed provider call: the event stream plus attempt metadata.
///
/// Tracks the time of the last received chunk and, when the turn completes,
/// emits one structured call-log record (provider, model, category, latency,
/// usage, fallback flag).
#[derive(Debug)]
pub struct RoutedTurn {
    provider: String,
    model: String,
    category: RoutingCategory,
    fallback_used: bool,
    breaker: Arc<CircuitBreaker>,
    pending_first: Option<TurnEvent>,
    stream: TurnStream,
    started_at: Instant,
}

impl RoutedTurn {
    /// The provider serving this call.
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Whether this call landed on a non-first candidate.
    pub fn fallback_used(&self) -> bool {
        self.fallback_used
    }

    /// Receive the next event; `None` once the stream is exhausted.
    ///
    /// A mid-stream error (after the call committed) is recorded as a
    /// circuit failure but is not retried on another provider -- partial
    /// output cannot be replayed.
    pub async fn next_event(&mut self) -> Option<Result<TurnEvent>> {
        let event = match self.pending_first.take() {
            Some(first) => Some(Ok(first)),
            None => self.stream.next_event().await,
        };

        match &event {
            Some(Ok(TurnEvent::TurnComplete(summary))) => {
                // Latency stops at the last received chunk.
                let latency_ms = self.started_at.elapsed().as_millis() as u64;
                tracing::info!(
                    provider = %self.provider,
                    model = %self.model,
                    category = %self.category,
                    latency_ms,
                    fallback = self.fallback_used,
                    input_tokens = summary.usage.input_tokens,
                    output_tokens = summary.usage.output_tokens,
                    cache_read_tokens = summary.usage.cache_read_tokens,
                    "provider call complete"
                );
            }
            Some(Err(e)) => {
                self.breaker.record_failure(&self.provider);
                tracing::warn!(provider = %self.provider, error = %e, "mid-stream provider failure");
            }
            _ => {}
        }

        event
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;
    use crate::testing::{ScriptedProvider, text_summary};
    use crate::usage::TokenUsage;

    fn table(routes: &[(RoutingCategory, &[&str])], fallback: &str) -> RoutingTable {
        RoutingTable {
            routes: routes
                .iter()
                .map(|(c, providers)| {
                    (
                        *c,
                        RoutePlan {
                            providers: providers.iter().map(|s| s.to_string()).collect(),
                            large_context: None,
                            context_threshold_tokens: None,
                        },
                    )
                })
                .collect(),
            fallback_provider: fallback.to_owned(),
        }
    }

    fn request() -> TurnRequest {
        TurnRequest {
            messages: vec![Message::user("hello")],
            system: None,
            tools: vec![],
            max_tokens: 256,
        }
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(BreakerConfig::default()))
    }

    async fn drain(mut turn: RoutedTurn) -> Vec<TurnEvent> {
        let mut events = Vec::new();
        while let Some(event) = turn.next_event().await {
            events.push(event.expect("stream should not error"));
        }
        events
    }

    #[test]
    fn unknown_provider_in_table_is_rejected() {
        let primary = Arc::new(ScriptedProvider::new("primary", "big"));
        let result = ModelRouter::new(
            vec![primary],
            table(&[(RoutingCategory::Routine, &["primary", "ghost"])], "primary"),
            breaker(),
        );
        assert!(matches!(result, Err(AgentError::Config { .. })));
    }

    #[test]
    fn candidates_always_end_with_fallback() {
        let t = table(&[(RoutingCategory::Routine, &["primary", "secondary"])], "local");
        assert_eq!(
            t.candidates(RoutingCategory::Routine, 0),
            vec!["primary", "secondary", "local"]
        );
        // Unlisted categories fall back to the unknown plan (absent here),
        // leaving just the local fallback.
        assert_eq!(t.candidates(RoutingCategory::Persona, 0), vec!["local"]);
    }

    #[test]
    fn large_context_promotes_ordering() {
        let t = RoutingTable {
            routes: HashMap::from([(
                RoutingCategory::Summarization,
                RoutePlan {
                    providers: vec!["primary".into()],
                    large_context: Some(vec!["secondary".into()]),
                    context_threshold_tokens: Some(100_000),
                },
            )]),
            fallback_provider: "local".into(),
        };
        assert_eq!(
            t.candidates(RoutingCategory::Summarization, 50_000),
            vec!["primary", "local"]
        );
        assert_eq!(
            t.candidates(RoutingCategory::Summarization, 150_000),
            vec!["secondary", "local"]
        );
    }

    #[test]
    fn approximate_tokens_counts_chars_over_four() {
        let messages = vec![Message::user("a".repeat(400))];
        assert_eq!(approximate_tokens(&messages, Some(&"b".repeat(40))), 110);
    }

    #[tokio::test]
    async fn falls_back_to_next_candidate_on_failure() {
        let primary = Arc::new(ScriptedProvider::new("primary", "big"));
        primary.fail_next_connect("connection refused");
        let local = Arc::new(ScriptedProvider::new("local", "small"));
        local.succeed_next(text_summary("hi there", TokenUsage::ZERO));

        let router = ModelRouter::new(
            vec![primary.clone(), local.clone()],
            table(&[(RoutingCategory::Routine, &["primary"])], "local"),
            breaker(),
        )
        .unwrap();

        let turn = router
            .stream_with_fallback(&request(), RoutingCategory::Routine, 0)
            .await
            .expect("fallback should succeed");
        assert_eq!(turn.provider(), "local");
        assert!(turn.fallback_used());

        let events = drain(turn).await;
        assert!(matches!(events.last(), Some(TurnEvent::TurnComplete(_))));

        assert_eq!(primary.calls(), 1);
        assert_eq!(local.calls(), 1);
        assert_eq!(router.last_used().as_deref(), Some("local:small"));
    }

    #[tokio::test]
    async fn exhaustion_attempts_each_candidate_once() {
        let primary = Arc::new(ScriptedProvider::new("primary", "big"));
        primary.fail_next_connect("timeout");
        let secondary = Arc::new(ScriptedProvider::new("secondary", "medium"));
        secondary.fail_next_connect("timeout");
        let local = Arc::new(ScriptedProvider::new("local", "small"));
        local.fail_next_connect("not running");

        let router = ModelRouter::new(
            vec![primary.clone(), secondary.clone(), local.clone()],
            table(&[(RoutingCategory::Reasoning, &["primary", "secondary"])], "local"),
            breaker(),
        )
        .unwrap();

        let result = router
            .stream_with_fallback(&request(), RoutingCategory::Reasoning, 0)
            .await;

        match result {
            Err(AgentError::ProviderExhausted { attempts, category, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(category, "reasoning");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(primary.calls(), 1);
        assert_eq!(secondary.calls(), 1);
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn open_circuit_skips_provider_without_attempt() {
        let primary = Arc::new(ScriptedProvider::new("primary", "big"));
        let local = Arc::new(ScriptedProvider::new("local", "small"));
        local.succeed_next(text_summary("ok", TokenUsage::ZERO));

        let breaker = breaker();
        // Trip the primary's circuit before routing.
        for _ in 0..3 {
            breaker.record_failure("primary");
        }

        let router = ModelRouter::new(
            vec![primary.clone(), local.clone()],
            table(&[(RoutingCategory::Routine, &["primary"])], "local"),
            breaker,
        )
        .unwrap();

        let turn = router
            .stream_with_fallback(&request(), RoutingCategory::Routine, 0)
            .await
            .expect("local should serve");
        assert_eq!(turn.provider(), "local");
        assert_eq!(primary.calls(), 0);
    }

    #[tokio::test]
    async fn primary_timeouts_land_on_secondary_and_are_counted() {
        let primary = Arc::new(ScriptedProvider::new("primary", "big"));
        primary.fail_next_connect("timeout");
        primary.fail_next_connect("timeout");
        let secondary = Arc::new(ScriptedProvider::new("secondary", "medium"));
        secondary.succeed_next(text_summary("one", TokenUsage::ZERO));
        secondary.succeed_next(text_summary("two", TokenUsage::ZERO));
        let local = Arc::new(ScriptedProvider::new("local", "small"));

        let router = ModelRouter::new(
            vec![primary.clone(), secondary.clone(), local],
            table(&[(RoutingCategory::Routine, &["primary", "secondary"])], "local"),
            breaker(),
        )
        .unwrap();

        for expected in ["one", "two"] {
            let turn = router
                .stream_with_fallback(&request(), RoutingCategory::Routine, 0)
                .await
                .expect("secondary should serve");
            assert_eq!(turn.provider(), "secondary");
            let events = drain(turn).await;
            match events.last() {
                Some(TurnEvent::TurnComplete(summary)) => assert_eq!(summary.text, expected),
                other => panic!("unexpected final event: {other:?}"),
            }
        }

        assert_eq!(secondary.calls(), 2);
        let snap = router.breaker().snapshot("primary").unwrap();
        assert_eq!(snap.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn auth_failure_still_falls_back() {
        let primary = Arc::new(ScriptedProvider::new("primary", "big"));
        primary.fail_next_auth("invalid x-api-key");
        let local = Arc::new(ScriptedProvider::new("local", "small"));
        local.succeed_next(text_summary("served locally", TokenUsage::ZERO));

        let router = ModelRouter::new(
            vec![primary.clone(), local],
            table(&[(RoutingCategory::Safety, &["primary"])], "local"),
            breaker(),
        )
        .unwrap();

        let turn = router
            .stream_with_fallback(&request(), RoutingCategory::Safety, 0)
            .await
            .expect("auth failure must not be fatal");
        assert_eq!(turn.provider(), "local");
        assert_eq!(router.breaker().snapshot("primary").unwrap().total_failures, 1);
    }
}
