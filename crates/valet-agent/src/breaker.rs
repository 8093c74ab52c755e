//! Per-provider circuit breaker.
//!
//! Tracks consecutive failures per provider and gates whether the router may
//! attempt it.  After a threshold of failures the circuit opens and the
//! provider is skipped for a cool-down window; the first attempt after the
//! window gets exactly one trial call, whose outcome either closes the
//! circuit or reopens it.
//!
//! # States
//!
//! ```text
//! Closed  --N consecutive failures-->  Open
//! Open    --cool-down elapsed------->  HalfOpen   (one trial call)
//! HalfOpen --trial success---------->  Closed
//! HalfOpen --trial failure---------->  Open       (cool-down restarts)
//! ```
//!
//! State is process-local and shared across every exchange in the process:
//! one mutex-guarded [`ProviderState`] per provider, held only for the
//! duration of a transition, never for the provider call itself.  Nothing is
//! persisted -- a restarted process re-probes all providers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Thresholds governing all circuits in a registry.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,

    /// How long an open circuit blocks attempts before allowing a trial.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

// ---------------------------------------------------------------------------
// Provider state
// ---------------------------------------------------------------------------

/// Current position of one provider's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation; attempts pass through.
    Closed,
    /// Failing fast; attempts are blocked until the cool-down elapses.
    Open,
    /// One trial call is in flight; further attempts are blocked until its
    /// outcome is recorded.
    HalfOpen,
}

/// Mutable per-provider state, owned exclusively by the breaker.
#[derive(Debug)]
struct ProviderState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,

    // Lifetime stats for diagnostics.
    total_successes: u64,
    total_failures: u64,
    total_blocked: u64,
}

impl ProviderState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            total_successes: 0,
            total_failures: 0,
            total_blocked: 0,
        }
    }
}

/// Diagnostic snapshot of one circuit.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_blocked: u64,
}

// ---------------------------------------------------------------------------
// Breaker registry
// ---------------------------------------------------------------------------

/// Registry of circuits, one per provider name, shared process-wide.
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    circuits: DashMap<String, Mutex<ProviderState>>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    /// Create a registry with the given thresholds.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            circuits: DashMap::new(),
            config,
        }
    }

    /// Whether `provider` may be attempted right now.
    ///
    /// Returns `false` while the circuit is open and the cool-down has not
    /// elapsed, and while a half-open trial is already in flight.  The first
    /// caller after the cool-down performs the `Open -> HalfOpen` transition
    /// under the provider's mutex and is granted the single trial call, so
    /// concurrent exchanges racing to probe a recovering provider produce
    /// exactly one trial.
    pub fn allow(&self, provider: &str) -> bool {
        let entry = self.circuit(provider);
        let mut state = entry.lock().expect("breaker mutex poisoned");

        match state.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => {
                state.total_blocked += 1;
                false
            }
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.cooldown {
                    tracing::info!(provider, "circuit half-open; allowing one trial call");
                    state.state = CircuitState::HalfOpen;
                    true
                } else {
                    state.total_blocked += 1;
                    false
                }
            }
        }
    }

    /// Record a successful call: the circuit closes and the failure streak
    /// resets.
    pub fn record_success(&self, provider: &str) {
        let entry = self.circuit(provider);
        let mut state = entry.lock().expect("breaker mutex poisoned");

        if state.state != CircuitState::Closed {
            tracing::info!(provider, from = ?state.state, "circuit closed after success");
        }
        state.state = CircuitState::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.total_successes += 1;
    }

    /// Record a failed call.  A half-open trial failure reopens the circuit
    /// immediately and restarts the cool-down; otherwise the circuit opens
    /// once the failure streak reaches the threshold.
    pub fn record_failure(&self, provider: &str) {
        let entry = self.circuit(provider);
        let mut state = entry.lock().expect("breaker mutex poisoned");

        state.consecutive_failures += 1;
        state.total_failures += 1;

        match state.state {
            CircuitState::HalfOpen => {
                tracing::warn!(provider, "trial call failed; circuit reopened");
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
            }
            CircuitState::Closed if state.consecutive_failures >= self.config.failure_threshold => {
                tracing::warn!(
                    provider,
                    failures = state.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "failure threshold reached; circuit opened"
                );
                state.state = CircuitState::Open;
                state.opened_at = Some(Instant::now());
            }
            _ => {
                tracing::debug!(
                    provider,
                    failures = state.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "failure recorded"
                );
            }
        }
    }

    /// Diagnostic snapshot of one provider's circuit, if it has been used.
    pub fn snapshot(&self, provider: &str) -> Option<BreakerSnapshot> {
        self.circuits.get(provider).map(|entry| {
            let state = entry.lock().expect("breaker mutex poisoned");
            BreakerSnapshot {
                provider: provider.to_owned(),
                state: state.state,
                consecutive_failures: state.consecutive_failures,
                total_successes: state.total_successes,
                total_failures: state.total_failures,
                total_blocked: state.total_blocked,
            }
        })
    }

    /// Snapshots for every provider the registry has seen.
    pub fn summary(&self) -> Vec<BreakerSnapshot> {
        self.circuits
            .iter()
            .map(|entry| {
                let state = entry.value().lock().expect("breaker mutex poisoned");
                BreakerSnapshot {
                    provider: entry.key().clone(),
                    state: state.state,
                    consecutive_failures: state.consecutive_failures,
                    total_successes: state.total_successes,
                    total_failures: state.total_failures,
                    total_blocked: state.total_blocked,
                }
            })
            .collect()
    }

    // -- Private helpers ----------------------------------------------------

    fn circuit(
        &self,
        provider: &str,
    ) -> dashmap::mapref::one::Ref<'_, String, Mutex<ProviderState>> {
        if let Some(entry) = self.circuits.get(provider) {
            return entry;
        }
        self.circuits
            .entry(provider.to_owned())
            .or_insert_with(|| Mutex::new(ProviderState::new()))
            .downgrade()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fast_breaker(threshold: u32, cooldown_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
        })
    }

    #[test]
    fn opens_after_threshold() {
        let breaker = fast_breaker(3, 1_000);

        breaker.record_failure("primary");
        breaker.record_failure("primary");
        assert!(breaker.allow("primary"));

        breaker.record_failure("primary");
        assert!(!breaker.allow("primary"));
        assert_eq!(
            breaker.snapshot("primary").unwrap().state,
            CircuitState::Open
        );
    }

    #[test]
    fn success_resets_failure_streak() {
        let breaker = fast_breaker(3, 1_000);

        breaker.record_failure("primary");
        breaker.record_failure("primary");
        breaker.record_success("primary");
        breaker.record_failure("primary");
        breaker.record_failure("primary");

        // Streak was reset, so two more failures do not open the circuit.
        assert!(breaker.allow("primary"));
    }

    #[test]
    fn cooldown_grants_exactly_one_trial() {
        let breaker = fast_breaker(1, 20);

        breaker.record_failure("primary");
        assert!(!breaker.allow("primary"));

        std::thread::sleep(Duration::from_millis(30));

        // First caller after the window gets the trial; the next is blocked
        // until the trial outcome is recorded.
        assert!(breaker.allow("primary"));
        assert!(!breaker.allow("primary"));
        assert_eq!(
            breaker.snapshot("primary").unwrap().state,
            CircuitState::HalfOpen
        );
    }

    #[test]
    fn trial_success_closes_circuit() {
        let breaker = fast_breaker(1, 10);

        breaker.record_failure("primary");
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow("primary"));

        breaker.record_success("primary");
        let snap = breaker.snapshot("primary").unwrap();
        assert_eq!(snap.state, CircuitState::Closed);
        assert_eq!(snap.consecutive_failures, 0);
        assert!(breaker.allow("primary"));
    }

    #[test]
    fn trial_failure_reopens_and_restarts_cooldown() {
        let breaker = fast_breaker(1, 40);

        breaker.record_failure("primary");
        std::thread::sleep(Duration::from_millis(50));
        assert!(breaker.allow("primary"));

        breaker.record_failure("primary");
        assert_eq!(
            breaker.snapshot("primary").unwrap().state,
            CircuitState::Open
        );
        // Cool-down restarted, so the provider stays blocked right away.
        assert!(!breaker.allow("primary"));
    }

    #[test]
    fn concurrent_probes_race_for_one_trial() {
        let breaker = Arc::new(fast_breaker(1, 10));
        breaker.record_failure("primary");
        std::thread::sleep(Duration::from_millis(20));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let breaker = Arc::clone(&breaker);
            handles.push(std::thread::spawn(move || breaker.allow("primary")));
        }
        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap_or(false))
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(allowed, 1);
    }

    #[test]
    fn providers_are_independent() {
        let breaker = fast_breaker(1, 1_000);

        breaker.record_failure("primary");
        assert!(!breaker.allow("primary"));
        assert!(breaker.allow("secondary"));
        assert!(breaker.allow("local"));
    }

    #[test]
    fn summary_covers_all_seen_providers() {
        let breaker = fast_breaker(2, 1_000);
        breaker.record_success("a");
        breaker.record_failure("b");

        let mut summary = breaker.summary();
        summary.sort_by(|x, y| x.provider.cmp(&y.provider));
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].total_successes, 1);
        assert_eq!(summary[1].total_failures, 1);
    }
}
