//! Configuration surface.
//!
//! Everything tunable about the orchestration core lives in one TOML file:
//! the provider fleet, the routing table, circuit-breaker thresholds, the
//! engine's turn and wall-clock limits, and the detach policy.  API keys are
//! never stored in the file -- each provider names an environment variable,
//! resolved at adapter-build time (a `.env` file is honored via `dotenvy`).

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::BreakerConfig;
use crate::engine::EngineConfig;
use crate::error::{AgentError, Result};
use crate::provider::ProviderAdapter;
use crate::provider::anthropic::AnthropicAdapter;
use crate::provider::openai::OpenAiCompatAdapter;
use crate::router::RoutingTable;
use crate::service::DetachPolicy;

// ---------------------------------------------------------------------------
// Provider configuration
// ---------------------------------------------------------------------------

/// Which wire dialect a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    /// Anthropic-style Messages API.
    Anthropic,
    /// OpenAI-style Chat Completions API (cloud or local).
    OpenaiCompatible,
}

/// Configuration for one provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Routing/breaker identity (e.g. `"primary"`, `"local"`).
    pub name: String,

    /// Wire dialect.
    pub kind: ProviderKind,

    /// Base URL for the API endpoint.
    pub base_url: String,

    /// The model identifier to request.
    pub model: String,

    /// Environment variable holding the API key.  Absent for local
    /// backends that do not authenticate.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key from the environment.
    fn api_key(&self) -> Result<String> {
        match &self.api_key_env {
            None => Ok(String::new()),
            Some(var) => std::env::var(var).map_err(|_| AgentError::Config {
                reason: format!(
                    "provider `{}`: environment variable `{var}` is not set",
                    self.name
                ),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Settings sections
// ---------------------------------------------------------------------------

/// `[breaker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Consecutive failures before a circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds an open circuit blocks attempts before the trial call.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    60
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold,
            cooldown: Duration::from_secs(settings.cooldown_secs),
        }
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Maximum model turns per exchange.
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// Maximum tokens per model turn.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Hard wall-clock ceiling for one exchange, in seconds.
    #[serde(default = "default_ceiling_secs")]
    pub exchange_ceiling_secs: u64,
}

fn default_max_turns() -> u32 {
    8
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_ceiling_secs() -> u64 {
    7_200
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            max_tokens: default_max_tokens(),
            exchange_ceiling_secs: default_ceiling_secs(),
        }
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            max_turns: settings.max_turns,
            max_tokens: settings.max_tokens,
            exchange_ceiling: Duration::from_secs(settings.exchange_ceiling_secs),
        }
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// The full configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValetConfig {
    /// The provider fleet.
    pub providers: Vec<ProviderConfig>,

    /// Category-to-candidate routing table.
    pub routing: RoutingTable,

    /// Circuit-breaker thresholds.
    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Agentic loop limits.
    #[serde(default)]
    pub engine: EngineSettings,

    /// Detachable request policy.
    #[serde(default)]
    pub detach: DetachPolicy,
}

impl ValetConfig {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| AgentError::Config {
            reason: format!("invalid config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file, honoring a `.env` file for API keys.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        dotenvy::dotenv().ok();
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| AgentError::Config {
            reason: format!("cannot read config `{}`: {e}", path.display()),
        })?;
        Self::from_toml_str(&text)
    }

    /// Check internal consistency: every routed provider must exist, and the
    /// fallback provider must be part of the fleet.
    pub fn validate(&self) -> Result<()> {
        let names: HashSet<&str> = self.providers.iter().map(|p| p.name.as_str()).collect();

        if names.len() != self.providers.len() {
            return Err(AgentError::Config {
                reason: "duplicate provider names".to_owned(),
            });
        }

        if !names.contains(self.routing.fallback_provider.as_str()) {
            return Err(AgentError::Config {
                reason: format!(
                    "fallback provider `{}` is not configured",
                    self.routing.fallback_provider
                ),
            });
        }

        for (category, plan) in &self.routing.routes {
            let listed = plan
                .providers
                .iter()
                .chain(plan.large_context.iter().flatten());
            for name in listed {
                if !names.contains(name.as_str()) {
                    return Err(AgentError::Config {
                        reason: format!(
                            "route `{category}` references unknown provider `{name}`"
                        ),
                    });
                }
            }
        }

        if self.engine.max_turns == 0 {
            return Err(AgentError::Config {
                reason: "engine.max_turns must be at least 1".to_owned(),
            });
        }

        Ok(())
    }

    /// Construct adapters for the configured fleet, resolving API keys from
    /// the environment.
    pub fn build_adapters(&self) -> Result<Vec<Arc<dyn ProviderAdapter>>> {
        self.providers
            .iter()
            .map(|p| -> Result<Arc<dyn ProviderAdapter>> {
                let api_key = p.api_key()?;
                match p.kind {
                    ProviderKind::Anthropic => Ok(Arc::new(AnthropicAdapter::new(
                        &p.name, &p.model, &p.base_url, api_key,
                    )?)),
                    ProviderKind::OpenaiCompatible => Ok(Arc::new(OpenAiCompatAdapter::new(
                        &p.name, &p.model, &p.base_url, api_key,
                    )?)),
                }
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RoutingCategory;
    use std::io::Write;

    const SAMPLE: &str = r#"
        [[providers]]
        name = "primary"
        kind = "anthropic"
        base_url = "https://api.anthropic.example"
        model = "sonnet-latest"
        api_key_env = "VALET_PRIMARY_KEY"

        [[providers]]
        name = "secondary"
        kind = "openai-compatible"
        base_url = "https://api.mistral.example/v1"
        model = "medium-latest"
        api_key_env = "VALET_SECONDARY_KEY"

        [[providers]]
        name = "thinker"
        kind = "openai-compatible"
        base_url = "https://api.moonshot.example/v1"
        model = "k2-thinking"
        api_key_env = "VALET_THINKER_KEY"

        [[providers]]
        name = "local"
        kind = "openai-compatible"
        base_url = "http://127.0.0.1:11434/v1"
        model = "assistant-8b"

        [routing]
        fallback_provider = "local"

        [routing.routes.routine]
        providers = ["secondary", "primary"]

        [routing.routes.summarization]
        providers = ["primary"]
        large_context = ["secondary"]
        context_threshold_tokens = 100000

        [routing.routes.reasoning]
        providers = ["primary"]
        large_context = ["thinker"]
        context_threshold_tokens = 128000

        [routing.routes.unknown]
        providers = ["primary"]

        [breaker]
        failure_threshold = 4
        cooldown_secs = 30

        [engine]
        max_turns = 6

        [detach]
        categories = ["reasoning", "summarization"]
        acknowledgment = "Working on it."
    "#;

    #[test]
    fn parses_full_config() {
        let config = ValetConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.providers.len(), 4);
        assert_eq!(config.providers[0].kind, ProviderKind::Anthropic);
        assert_eq!(config.breaker.failure_threshold, 4);
        assert_eq!(config.breaker.cooldown_secs, 30);
        assert_eq!(config.engine.max_turns, 6);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.engine.max_tokens, 4096);
        assert_eq!(config.engine.exchange_ceiling_secs, 7_200);

        assert!(config.detach.categories.contains(&RoutingCategory::Reasoning));
        assert!(
            config
                .detach
                .categories
                .contains(&RoutingCategory::Summarization)
        );

        let plan = &config.routing.routes[&RoutingCategory::Reasoning];
        assert_eq!(plan.context_threshold_tokens, Some(128_000));
        assert_eq!(plan.large_context.as_deref(), Some(&["thinker".to_owned()][..]));
    }

    #[test]
    fn settings_convert_to_runtime_configs() {
        let config = ValetConfig::from_toml_str(SAMPLE).unwrap();

        let breaker: BreakerConfig = (&config.breaker).into();
        assert_eq!(breaker.cooldown, Duration::from_secs(30));

        let engine: EngineConfig = (&config.engine).into();
        assert_eq!(engine.max_turns, 6);
        assert_eq!(engine.exchange_ceiling, Duration::from_secs(7_200));
    }

    #[test]
    fn unknown_provider_in_route_is_rejected() {
        let bad = SAMPLE.replace("providers = [\"secondary\", \"primary\"]", "providers = [\"ghost\"]");
        let result = ValetConfig::from_toml_str(&bad);
        assert!(matches!(result, Err(AgentError::Config { .. })));
    }

    #[test]
    fn missing_fallback_provider_is_rejected() {
        let bad = SAMPLE.replace("fallback_provider = \"local\"", "fallback_provider = \"ghost\"");
        let result = ValetConfig::from_toml_str(&bad);
        assert!(matches!(result, Err(AgentError::Config { .. })));
    }

    #[test]
    fn duplicate_provider_names_are_rejected() {
        let bad = SAMPLE.replace("name = \"secondary\"", "name = \"primary\"");
        let result = ValetConfig::from_toml_str(&bad);
        assert!(matches!(result, Err(AgentError::Config { .. })));
    }

    #[test]
    fn zero_max_turns_is_rejected() {
        let bad = SAMPLE.replace("max_turns = 6", "max_turns = 0");
        let result = ValetConfig::from_toml_str(&bad);
        assert!(matches!(result, Err(AgentError::Config { .. })));
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ValetConfig::load(file.path()).unwrap();
        assert_eq!(config.routing.fallback_provider, "local");
    }

    #[test]
    fn missing_api_key_env_fails_adapter_build() {
        let config = ValetConfig::from_toml_str(SAMPLE).unwrap();
        // The sample names env vars that this test deliberately leaves
        // unset, so building the fleet must fail with a config error.
        let result = config.build_adapters();
        assert!(matches!(result, Err(AgentError::Config { .. })));
    }

    #[test]
    fn local_provider_builds_without_api_key() {
        let config = ValetConfig::from_toml_str(SAMPLE).unwrap();
        let local = config
            .providers
            .iter()
            .find(|p| p.name == "local")
            .unwrap();
        assert!(local.api_key().unwrap().is_empty());
    }
}
