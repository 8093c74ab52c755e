//! Exchange service.
//!
//! The entry point the chat-transport adapter calls for every inbound
//! request.  Owns the control flow around the engine: acquire the user's
//! session lock, decide whether the request is detachable, and either run
//! the exchange inline (lock held throughout) or acknowledge, release the
//! lock, and hand the exchange to the background task runner so the
//! interactive session is never blocked on a slow request.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use valet_kernel::{BackgroundTaskRunner, JobId, OutboundSink, SessionLock, UserId};

use crate::engine::{AgenticStreamEngine, ExchangeOutcome};
use crate::error::Result;
use crate::provider::Message;
use crate::router::RoutingCategory;

// ---------------------------------------------------------------------------
// Request / reply types
// ---------------------------------------------------------------------------

/// One inbound user request, pre-classified by the upstream classifier.
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    /// The requesting user.
    pub user_id: UserId,

    /// The user's message text.
    pub text: String,

    /// Prior conversation turns, oldest first, not including `text`.
    pub history: Vec<Message>,

    /// System prompt for this exchange.
    pub system: Option<String>,

    /// Routing category from the upstream classifier.
    pub category: RoutingCategory,

    /// Human-readable label for a detached job ("monthly retrospective");
    /// falls back to the category name.
    pub label: Option<String>,
}

/// How an inbound request was handled.
#[derive(Debug)]
pub enum ExchangeReply {
    /// The exchange ran inline; the final answer was already delivered.
    Completed(ExchangeOutcome),

    /// The exchange was acknowledged and detached; the answer will arrive
    /// as a separate message when the job finishes.
    Detached(JobId),
}

// ---------------------------------------------------------------------------
// Detach policy
// ---------------------------------------------------------------------------

/// Which request categories run outside the interactive lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachPolicy {
    /// Categories long enough to process in the background.
    pub categories: HashSet<RoutingCategory>,

    /// The short acknowledgment sent before releasing the lock.
    pub acknowledgment: String,
}

impl Default for DetachPolicy {
    fn default() -> Self {
        Self {
            categories: HashSet::from([RoutingCategory::Reasoning]),
            acknowledgment: "On it. This will take a little while; I'll send the result when \
                             it's ready."
                .to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Brokers inbound requests between the session lock, the engine, and the
/// background runner.
pub struct ExchangeService {
    engine: Arc<AgenticStreamEngine>,
    sessions: SessionLock,
    runner: BackgroundTaskRunner,
    sink: Arc<dyn OutboundSink>,
    detach: DetachPolicy,
}

impl ExchangeService {
    /// Create the service.
    pub fn new(
        engine: Arc<AgenticStreamEngine>,
        sessions: SessionLock,
        runner: BackgroundTaskRunner,
        sink: Arc<dyn OutboundSink>,
        detach: DetachPolicy,
    ) -> Self {
        Self {
            engine,
            sessions,
            runner,
            sink,
            detach,
        }
    }

    /// The per-user session lock, shared with anything else that serializes
    /// on the user (e.g. scheduled triggers).
    pub fn sessions(&self) -> &SessionLock {
        &self.sessions
    }

    /// Handle one inbound request end to end.
    ///
    /// Detachable requests return [`ExchangeReply::Detached`] as soon as the
    /// acknowledgment is sent; everything else blocks until the exchange
    /// completes.  On a fatal error the user receives a short non-technical
    /// notice, the session lock is released unconditionally, and the error
    /// is returned to the transport adapter for its own logging.
    pub async fn handle(&self, request: ExchangeRequest) -> Result<ExchangeReply> {
        let user_id = request.user_id;
        let mut handle = self.sessions.acquire(user_id).await;

        let mut history = request.history;
        history.push(Message::user(request.text));

        if self.detach.categories.contains(&request.category) {
            // Hold the lock only long enough to acknowledge.
            self.sink
                .send_acknowledgment(user_id, &self.detach.acknowledgment)
                .await?;
            handle.release();

            let label = request
                .label
                .unwrap_or_else(|| request.category.to_string());
            let engine = Arc::clone(&self.engine);
            let system = request.system;
            let category = request.category;

            let job_id = self.runner.spawn(label.clone(), user_id, async move {
                engine
                    .run_detached(user_id, history, system, category)
                    .await
                    .map(|outcome| outcome.final_text)
            });

            tracing::info!(user_id, job_id = %job_id, job_label = %label, "exchange detached");
            return Ok(ExchangeReply::Detached(job_id));
        }

        // Inline path: the lock is held for the full exchange.
        let result = self
            .engine
            .run(user_id, history, request.system, request.category)
            .await;

        match result {
            Ok(outcome) => {
                handle.release();
                Ok(ExchangeReply::Completed(outcome))
            }
            Err(error) => {
                tracing::error!(user_id, error = %error, "exchange failed");
                if let Err(send_error) = self.sink.send(user_id, &error.user_notice()).await {
                    tracing::error!(user_id, error = %send_error, "could not deliver failure notice");
                }
                handle.release();
                Err(error)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker};
    use crate::engine::EngineConfig;
    use crate::error::AgentError;
    use crate::provider::ProviderAdapter;
    use crate::router::{ModelRouter, RoutePlan, RoutingTable};
    use crate::testing::{
        RecordingSink, ScriptedExecutor, ScriptedProvider, text_summary, tool_summary,
    };
    use crate::usage::TokenUsage;
    use std::collections::HashMap;
    use std::time::Duration;
    use valet_kernel::JobStatus;

    struct Harness {
        primary: Arc<ScriptedProvider>,
        executor: Arc<ScriptedExecutor>,
        sink: Arc<RecordingSink>,
        runner: BackgroundTaskRunner,
        service: ExchangeService,
    }

    fn harness() -> Harness {
        crate::testing::init_tracing();
        let primary = Arc::new(ScriptedProvider::new("primary", "big"));
        let local = Arc::new(ScriptedProvider::new("local", "small"));
        let executor = Arc::new(ScriptedExecutor::default());
        let sink = Arc::new(RecordingSink::default());

        let table = RoutingTable {
            routes: HashMap::from([
                (
                    RoutingCategory::Routine,
                    RoutePlan {
                        providers: vec!["primary".into()],
                        large_context: None,
                        context_threshold_tokens: None,
                    },
                ),
                (
                    RoutingCategory::Reasoning,
                    RoutePlan {
                        providers: vec!["primary".into()],
                        large_context: None,
                        context_threshold_tokens: None,
                    },
                ),
            ]),
            fallback_provider: "local".into(),
        };
        let adapters: Vec<Arc<dyn ProviderAdapter>> = vec![primary.clone(), local];
        let router = Arc::new(
            ModelRouter::new(
                adapters,
                table,
                Arc::new(CircuitBreaker::new(BreakerConfig::default())),
            )
            .unwrap(),
        );
        let engine = Arc::new(AgenticStreamEngine::new(
            router,
            executor.clone(),
            sink.clone(),
            EngineConfig::default(),
        ));
        let runner = BackgroundTaskRunner::new(sink.clone());
        let service = ExchangeService::new(
            engine,
            SessionLock::new(),
            runner.clone(),
            sink.clone(),
            DetachPolicy::default(),
        );

        Harness {
            primary,
            executor,
            sink,
            runner,
            service,
        }
    }

    fn request(category: RoutingCategory, text: &str) -> ExchangeRequest {
        ExchangeRequest {
            user_id: 1,
            text: text.to_owned(),
            history: Vec::new(),
            system: None,
            category,
            label: None,
        }
    }

    async fn wait_for_job(runner: &BackgroundTaskRunner, job_id: JobId) -> JobStatus {
        for _ in 0..200 {
            let status = runner.job(job_id).unwrap().status;
            if status != JobStatus::Running {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job did not finish in time");
    }

    #[tokio::test]
    async fn inline_exchange_completes_and_releases_lock() {
        let h = harness();
        h.primary.succeed_next(text_summary("hello!", TokenUsage::ZERO));

        let reply = h
            .service
            .handle(request(RoutingCategory::Routine, "hi"))
            .await
            .expect("exchange should complete");

        assert!(matches!(reply, ExchangeReply::Completed(_)));
        assert_eq!(h.sink.sent(), vec![(1, "hello!".to_owned())]);
        assert!(h.sink.acks().is_empty());
        assert!(!h.service.sessions().is_held(1));
    }

    #[tokio::test]
    async fn detachable_request_acknowledges_then_delivers_separately() {
        let h = harness();
        let t = crate::provider::ToolRequest {
            id: "toolu_1".into(),
            name: "research".into(),
            arguments: serde_json::json!({}),
        };
        h.primary
            .succeed_next(tool_summary("", vec![t], TokenUsage::ZERO));
        h.primary
            .succeed_next(text_summary("your retrospective", TokenUsage::ZERO));
        // A slow tool keeps the job running while we inspect the lock.
        h.executor
            .succeed_after("research", Duration::from_millis(60), "notes");

        let reply = h
            .service
            .handle(ExchangeRequest {
                label: Some("monthly retrospective".into()),
                ..request(RoutingCategory::Reasoning, "synthesize a monthly retrospective")
            })
            .await
            .expect("detach should succeed");

        let ExchangeReply::Detached(job_id) = reply else {
            panic!("expected a detached reply");
        };

        // The acknowledgment is already out and the interactive lock is
        // free while the job still runs.
        assert_eq!(h.sink.acks().len(), 1);
        assert_eq!(h.runner.job(job_id).unwrap().status, JobStatus::Running);
        assert!(!h.service.sessions().is_held(1));
        assert!(h.service.sessions().try_acquire(1).is_some());

        // The completion message arrives as a separate send once the job
        // finishes -- exactly one.
        assert_eq!(wait_for_job(&h.runner, job_id).await, JobStatus::Done);
        assert_eq!(h.sink.sent(), vec![(1, "your retrospective".to_owned())]);
    }

    #[tokio::test]
    async fn detached_failure_notifies_once_without_detail() {
        let h = harness();
        h.primary.fail_next_connect("overloaded");
        // Local fallback fails too, exhausting the chain inside the job.
        // (The harness local provider has no script, so it fails as
        // "script exhausted".)

        let reply = h
            .service
            .handle(request(RoutingCategory::Reasoning, "deep analysis"))
            .await
            .expect("detach itself should succeed");
        let ExchangeReply::Detached(job_id) = reply else {
            panic!("expected a detached reply");
        };

        assert_eq!(wait_for_job(&h.runner, job_id).await, JobStatus::Failed);
        let sent = h.sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("reasoning"));
        assert!(!sent[0].1.contains("overloaded"));

        let job = h.runner.job(job_id).unwrap();
        assert!(job.error.as_deref().unwrap().contains("failed"));
    }

    #[tokio::test]
    async fn fatal_inline_error_notifies_user_and_frees_lock() {
        let h = harness();
        h.primary.fail_next_connect("down");
        // Local has no script: it fails too, so the chain exhausts.

        let result = h
            .service
            .handle(request(RoutingCategory::Routine, "hi"))
            .await;

        assert!(matches!(result, Err(AgentError::ProviderExhausted { .. })));
        let sent = h.sink.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("try again"));
        assert!(!h.service.sessions().is_held(1));
    }

    #[tokio::test]
    async fn same_user_requests_serialize() {
        let h = harness();
        h.primary.succeed_next(text_summary("first", TokenUsage::ZERO));
        h.primary.succeed_next(text_summary("second", TokenUsage::ZERO));

        // Hold the user's lock, start a request, and confirm it cannot
        // complete until the lock is released.
        let held = h.service.sessions().acquire(1).await;

        let service = &h.service;
        let pending = service.handle(request(RoutingCategory::Routine, "one"));
        tokio::pin!(pending);

        let raced = tokio::time::timeout(Duration::from_millis(30), &mut pending).await;
        assert!(raced.is_err(), "request must wait for the session lock");

        drop(held);
        let reply = pending.await.expect("request should complete after release");
        assert!(matches!(reply, ExchangeReply::Completed(_)));
    }
}
