//! Valet kernel services.
//!
//! This crate provides the foundational services the valet orchestration
//! engine is built on.  Nothing in here knows about language models or
//! tools; it is the substrate that serializes per-user work and runs
//! long exchanges outside the interactive path:
//!
//! - **[`session`]** -- Per-user session lock.  At most one exchange may
//!   mutate a user's session at a time; handles release on drop so a
//!   panicking exchange never wedges the user.
//! - **[`background`]** -- Background task runner with an in-memory job
//!   registry.  Detached exchanges run here and deliver their result (or a
//!   failure notice) through the outbound sink exactly once.
//! - **[`outbound`]** -- The outbound message sink boundary trait.  The
//!   chat-transport adapter implements it; the kernel and the agent engine
//!   consume it.
//! - **[`error`]** -- Unified kernel error types via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime.

pub mod background;
pub mod error;
pub mod outbound;
pub mod session;

// Re-export the most commonly used types at the crate root for convenience.
pub use background::{BackgroundJob, BackgroundTaskRunner, JobId, JobStatus};
pub use error::{KernelError, Result};
pub use outbound::{AckHandle, OutboundSink};
pub use session::{SessionHandle, SessionLock, UserId};
