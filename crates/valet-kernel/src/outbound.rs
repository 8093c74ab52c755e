//! Outbound message sink boundary.
//!
//! The orchestration core never talks to a chat transport directly.  Final
//! answers, acknowledgments, and background-job notices all go through
//! [`OutboundSink`], implemented by the transport adapter (Telegram, Slack,
//! a test harness, ...).
//!
//! The contract is intentionally narrow: the core only ever sends *new*
//! messages.  There is no edit or delete capability, which is what makes the
//! engine's deliver-final-text-once discipline load-bearing.

use async_trait::async_trait;

use crate::error::Result;
use crate::session::UserId;

/// Opaque handle to a sent acknowledgment.
///
/// Returned so callers can correlate a later completion message with the
/// acknowledgment in logs; the core never edits the acknowledged message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckHandle {
    /// The user the acknowledgment was sent to.
    pub user_id: UserId,
    /// Transport-assigned message identifier, if the transport has one.
    pub message_id: Option<String>,
}

/// Destination for all user-visible output produced by the core.
///
/// Implementations must tolerate concurrent sends for *different* users;
/// sends for a single user are already serialized by the session lock and
/// the one-delivery-per-job rule, so a single user's stream is never
/// interleaved.
#[async_trait]
pub trait OutboundSink: Send + Sync {
    /// Deliver a message to the user as a new message.
    async fn send(&self, user_id: UserId, text: &str) -> Result<()>;

    /// Deliver a short acknowledgment (e.g. "working on it") and return a
    /// handle identifying the sent message.
    async fn send_acknowledgment(&self, user_id: UserId, text: &str) -> Result<AckHandle>;
}
