//! Background task runner.
//!
//! Detachable exchanges run here, outside the session lock, so a slow
//! multi-step request never blocks the interactive path.  Each job is
//! tracked in an in-memory registry and delivers its outcome through the
//! [`OutboundSink`] exactly once: the result text on success, a short
//! non-technical notice on failure.  Full failure detail goes to the log,
//! never to the user.
//!
//! # Job lifecycle
//!
//! ```text
//! Running  -->  Done
//!          \->  Failed
//! ```
//!
//! The terminal transition happens exactly once per job; the sink delivery
//! is gated on that transition, so a job can never notify twice or not at
//! all.  The registry is in-memory only -- job state does not survive a
//! process restart.  There is no cancellation handle; once launched a job
//! runs to completion or failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{KernelError, Result};
use crate::outbound::OutboundSink;
use crate::session::UserId;

/// Unique, time-ordered job identifier (UUID v7).
pub type JobId = Uuid;

/// Lifecycle state of a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    /// Currently executing.
    Running,
    /// Finished successfully; the result was delivered.
    Done,
    /// Finished with an error; a failure notice was delivered.
    Failed,
}

/// Metadata snapshot of a job visible to external callers.
#[derive(Debug, Clone)]
pub struct BackgroundJob {
    pub id: JobId,
    pub label: String,
    pub user_id: UserId,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Runs detached exchanges and delivers their outcomes.
///
/// Cheaply cloneable (`Arc`-backed) and safe to share across tasks.
#[derive(Clone)]
pub struct BackgroundTaskRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    /// Authoritative job metadata.
    jobs: DashMap<JobId, BackgroundJob>,

    /// Where job outcomes are delivered.
    sink: Arc<dyn OutboundSink>,
}

impl BackgroundTaskRunner {
    /// Create a runner that delivers job outcomes through `sink`.
    pub fn new(sink: Arc<dyn OutboundSink>) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                jobs: DashMap::new(),
                sink,
            }),
        }
    }

    /// Launch `work` as a background job for `user_id`.
    ///
    /// Returns immediately with the job id; the caller must already have
    /// released the session lock.  `work` resolves to the text to deliver on
    /// success, or an error whose detail is logged (the user only sees a
    /// short notice naming the `label`).
    pub fn spawn<F, E>(&self, label: impl Into<String>, user_id: UserId, work: F) -> JobId
    where
        F: Future<Output = std::result::Result<String, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let (id, handle) = self.spawn_tracked(label, user_id, work);
        drop(handle);
        id
    }

    /// Like [`spawn`](Self::spawn), but also returns the [`JoinHandle`] so
    /// tests and shutdown paths can await completion.
    pub fn spawn_tracked<F, E>(
        &self,
        label: impl Into<String>,
        user_id: UserId,
        work: F,
    ) -> (JobId, JoinHandle<()>)
    where
        F: Future<Output = std::result::Result<String, E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let id = Uuid::now_v7();
        let label = label.into();

        self.inner.jobs.insert(
            id,
            BackgroundJob {
                id,
                label: label.clone(),
                user_id,
                status: JobStatus::Running,
                started_at: Utc::now(),
                completed_at: None,
                error: None,
            },
        );

        tracing::info!(job_id = %id, job_label = %label, user_id, "background job started");

        let runner = self.clone();
        let handle = tokio::spawn(async move {
            let outcome = work.await;
            runner.complete(id, &label, user_id, outcome).await;
        });

        (id, handle)
    }

    /// Query the current state of a job.
    pub fn job(&self, job_id: JobId) -> Result<BackgroundJob> {
        self.inner
            .jobs
            .get(&job_id)
            .map(|entry| entry.clone())
            .ok_or(KernelError::JobNotFound { job_id })
    }

    /// Snapshot of all known jobs keyed by id.
    pub fn jobs(&self) -> HashMap<JobId, BackgroundJob> {
        self.inner
            .jobs
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    // -- Private helpers ----------------------------------------------------

    /// Record the terminal transition and deliver the outcome.
    ///
    /// The transition is performed under the registry entry's lock and only
    /// succeeds from `Running`, which is what guarantees exactly one
    /// delivery per job.
    async fn complete<E: std::fmt::Display>(
        &self,
        id: JobId,
        label: &str,
        user_id: UserId,
        outcome: std::result::Result<String, E>,
    ) {
        let (status, error) = match &outcome {
            Ok(_) => (JobStatus::Done, None),
            Err(e) => (JobStatus::Failed, Some(e.to_string())),
        };

        if let Err(e) = self.transition(id, status, error) {
            tracing::warn!(job_id = %id, error = %e, "skipping duplicate job completion");
            return;
        }

        let message = match outcome {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) => {
                tracing::warn!(job_id = %id, job_label = %label, "job produced empty output");
                format!("The {label} task finished, but produced no output.")
            }
            Err(e) => {
                tracing::error!(
                    job_id = %id,
                    job_label = %label,
                    user_id,
                    error = %e,
                    "background job failed"
                );
                format!("Sorry, the {label} task failed. Please try again later.")
            }
        };

        if let Err(e) = self.inner.sink.send(user_id, &message).await {
            tracing::error!(
                job_id = %id,
                user_id,
                error = %e,
                "could not deliver background job outcome"
            );
        } else {
            tracing::info!(job_id = %id, job_label = %label, status = ?status, "background job delivered");
        }
    }

    /// Move a job from `Running` to a terminal state.  Fails if the job is
    /// unknown or already terminal.
    fn transition(&self, id: JobId, status: JobStatus, error: Option<String>) -> Result<()> {
        let mut entry = self
            .inner
            .jobs
            .get_mut(&id)
            .ok_or(KernelError::JobNotFound { job_id: id })?;

        if entry.status != JobStatus::Running {
            return Err(KernelError::InvalidJobState {
                job_id: id,
                reason: format!("already terminal: {:?}", entry.status),
            });
        }

        entry.status = status;
        entry.completed_at = Some(Utc::now());
        entry.error = error;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
