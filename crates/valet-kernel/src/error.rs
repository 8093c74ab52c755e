//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

use uuid::Uuid;

/// Unified error type for the valet kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Background job errors ----------------------------------------------
    /// The referenced job does not exist in the registry.
    #[error("background job not found: {job_id}")]
    JobNotFound {
        /// The [`Uuid`] that was looked up.
        job_id: Uuid,
    },

    /// The job has already reached a terminal state and cannot be
    /// transitioned again.
    #[error("invalid job state transition for {job_id}: {reason}")]
    InvalidJobState { job_id: Uuid, reason: String },

    // -- Outbound sink errors -----------------------------------------------
    /// Delivering a message through the outbound sink failed.
    #[error("outbound delivery failed: {reason}")]
    SinkDeliveryFailed { reason: String },

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
