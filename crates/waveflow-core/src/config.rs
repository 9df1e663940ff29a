//! Engine defaults: retry, circuit, cache, call depth, and concurrency.
//! Values come from serde defaults and may be overridden per deployment
//! through environment variables.

use std::env;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::context::DEFAULT_MAX_CALL_DEPTH;
use crate::error::circuit_breaker::CircuitBreakerConfig;
use crate::error::retry::RetryPolicy;
use crate::executor::cache::CacheConfig;

/// Process-wide engine configuration. Step and task overrides win over
/// these defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Maximum sub-workflow call-chain length.
    pub max_depth: usize,
    /// Cap on concurrently running steps; `None` bounds only by wave width.
    pub max_concurrency: Option<usize>,
    pub default_retry: RetryPolicy,
    pub default_circuit: CircuitBreakerConfig,
    pub default_cache: CacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_CALL_DEPTH,
            max_concurrency: None,
            default_retry: RetryPolicy::default(),
            default_circuit: CircuitBreakerConfig::default(),
            default_cache: CacheConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults with environment overrides applied:
    /// `WAVEFLOW_MAX_DEPTH`, `WAVEFLOW_MAX_CONCURRENCY`,
    /// `WAVEFLOW_RETRY_MAX_ATTEMPTS`, `WAVEFLOW_CIRCUIT_FAILURE_THRESHOLD`,
    /// `WAVEFLOW_CACHE_TTL_SECONDS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.max_depth = env_or("WAVEFLOW_MAX_DEPTH", config.max_depth);
        config.max_concurrency = env_opt("WAVEFLOW_MAX_CONCURRENCY").or(config.max_concurrency);
        config.default_retry.max_attempts =
            env_or("WAVEFLOW_RETRY_MAX_ATTEMPTS", config.default_retry.max_attempts);
        config.default_circuit.failure_threshold = env_or(
            "WAVEFLOW_CIRCUIT_FAILURE_THRESHOLD",
            config.default_circuit.failure_threshold,
        );
        config.default_cache.ttl_seconds =
            env_or("WAVEFLOW_CACHE_TTL_SECONDS", config.default_cache.ttl_seconds);
        config
    }
}

fn env_or<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, raw, "unparseable environment override, keeping default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_opt<T>(key: &str) -> Option<T>
where
    T: FromStr,
{
    env::var(key).ok().and_then(|raw| raw.parse().ok())
}
