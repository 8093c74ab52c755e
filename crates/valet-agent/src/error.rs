//! Agent error types.
//!
//! All orchestration subsystems surface errors through [`AgentError`].  The
//! taxonomy matters: transport and auth failures are recoverable by falling
//! back to another provider, tool failures are absorbed into the
//! conversation, and only [`AgentError::ProviderExhausted`] and
//! [`AgentError::ExchangeTimeout`] ever reach the user.

use valet_kernel::KernelError;

/// Unified error type for the orchestration engine.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Provider errors (recoverable by fallback) ---------------------------
    /// Network, timeout, rate-limit, or server-side failure from a provider.
    #[error("provider `{provider}` transport failure: {reason}")]
    ProviderTransport { provider: String, reason: String },

    /// The provider rejected our credentials.  Recoverable by fallback, but
    /// logged at error severity since it indicates misconfiguration.
    #[error("provider `{provider}` rejected credentials: {reason}")]
    ProviderAuth { provider: String, reason: String },

    /// The provider's stream produced data we could not parse.
    #[error("provider `{provider}` stream parse error: {reason}")]
    StreamParse { provider: String, reason: String },

    // -- Fatal exchange errors ----------------------------------------------
    /// Every candidate in the fallback chain failed.  Fatal for the exchange.
    #[error("all {attempts} provider(s) for category `{category}` failed; last error: {last_error}")]
    ProviderExhausted {
        category: String,
        attempts: usize,
        last_error: String,
    },

    /// The exchange exceeded its wall-clock ceiling.  Fatal.
    #[error("exchange exceeded its {ceiling_secs}s wall-clock ceiling")]
    ExchangeTimeout { ceiling_secs: u64 },

    /// The agentic loop exceeded its turn limit without a final answer.
    #[error("agentic loop exceeded max turns ({max_turns})")]
    MaxTurnsExceeded { max_turns: u32 },

    // -- Loop errors --------------------------------------------------------
    /// A tool invocation failed.  Absorbed into the conversation as a
    /// synthesized tool result; never propagated out of the loop.
    #[error("tool `{tool_name}` failed: {reason}")]
    ToolExecutionFailed { tool_name: String, reason: String },

    /// The exchange state machine was asked to make an illegal transition.
    /// Indicates a bug in the engine, not in user input.
    #[error("illegal exchange phase transition: {from} -> {to}")]
    InvalidPhaseTransition { from: String, to: String },

    // -- Configuration errors -----------------------------------------------
    /// Configuration loading or validation failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // -- Upstream crate errors -----------------------------------------------
    /// An error propagated from the kernel crate.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl AgentError {
    /// Whether the fallback chain may try the next candidate after this
    /// error.  Only per-provider failures are recoverable; fatal exchange
    /// errors and engine bugs are not.
    pub fn is_recoverable_by_fallback(&self) -> bool {
        matches!(
            self,
            Self::ProviderTransport { .. } | Self::ProviderAuth { .. } | Self::StreamParse { .. }
        )
    }

    /// The short, non-technical message shown to the user for fatal errors.
    /// Everything else renders as a generic notice; detail stays in the log.
    pub fn user_notice(&self) -> String {
        match self {
            Self::ProviderExhausted { .. } => {
                "I couldn't reach any of my model providers just now. Please try again in a \
                 few minutes."
                    .to_owned()
            }
            Self::ExchangeTimeout { .. } => {
                "That took longer than I allow for a single request, so I stopped. Please try \
                 a smaller request."
                    .to_owned()
            }
            _ => "Something went wrong while handling that request. Please try again.".to_owned(),
        }
    }
}
