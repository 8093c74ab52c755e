//! Token usage accounting.
//!
//! Every provider call reports a [`TokenUsage`]; the engine sums them across
//! all turns and fallback retries of an exchange so callers can log one
//! total per user-visible exchange.

use serde::{Deserialize, Serialize};

/// Token counts reported by a provider for one call.
///
/// Supports pointwise additive merge: the usage of an exchange is the sum of
/// the usage of every provider call it made.  Failed attempts never produce
/// a `TokenUsage`, so they contribute zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub input_tokens: u64,
    /// Tokens generated by the model.
    pub output_tokens: u64,
    /// Tokens written to the provider-side prompt cache.
    pub cache_creation_tokens: u64,
    /// Tokens served from the provider-side prompt cache.
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    /// Usage with all counters at zero.
    pub const ZERO: Self = Self {
        input_tokens: 0,
        output_tokens: 0,
        cache_creation_tokens: 0,
        cache_read_tokens: 0,
    };

    /// Pointwise sum of `self` and `other`.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            cache_creation_tokens: self.cache_creation_tokens + other.cache_creation_tokens,
            cache_read_tokens: self.cache_read_tokens + other.cache_read_tokens,
        }
    }

    /// Total billable tokens across all counters.
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }
}

impl std::ops::Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.merge(rhs)
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = self.merge(rhs);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
