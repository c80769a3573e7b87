//! `GatewayConfig` — spec §6's enumerated configuration options.
//!
//! Grounded on `llm::provider::ProviderConfig::default()`'s pattern (a plain
//! struct with a compiled-in `Default`, optionally overridden). `serde_yaml`
//! is the teacher's declared-but-unused dependency; this is its first use.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ParallelToolsConfig {
    pub enabled: bool,
    pub concurrency: usize,
    pub max_concurrency: usize,
    pub timeout_ms: u64,
}

impl Default for ParallelToolsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            concurrency: 3,
            max_concurrency: 5,
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptCacheConfig {
    pub enabled: bool,
}

impl Default for PromptCacheConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub max_iterations: u32,
    pub retry: RetryConfig,
    pub parallel_tools: ParallelToolsConfig,
    pub message_window: usize,
    /// Accepted for backward config compatibility, parsed and discarded
    /// (spec §6 marks this legacy — no longer used by the core).
    #[serde(default)]
    pub history_batch_flush_ms: Option<u64>,
    pub prompt_cache: PromptCacheConfig,
    /// Per-turn timeout; `None` means no timeout (spec §4.11 default).
    #[serde(default)]
    pub turn_timeout_ms: Option<u64>,
    pub bind_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            retry: RetryConfig::default(),
            parallel_tools: ParallelToolsConfig::default(),
            message_window: 200,
            history_batch_flush_ms: None,
            prompt_cache: PromptCacheConfig::default(),
            turn_timeout_ms: None,
            bind_addr: "127.0.0.1:8080".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Load from an optional YAML file, falling back to compiled-in
    /// defaults for anything the file doesn't set.
    pub fn load(path: Option<&Path>) -> Result<Self, crate::error::GatewayError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|e| {
            crate::error::GatewayError::InvalidConfig(format!(
                "failed to read config {}: {}",
                path.display(),
                e
            ))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            crate::error::GatewayError::InvalidConfig(format!("failed to parse config: {}", e))
        })
    }

    /// Per-user override of `max_iterations` (spec §4.6); `0` is rejected
    /// (spec §8 R boundary: `maxIterations = 0` must fail with `invalid_config`).
    pub fn with_max_iterations(
        mut self,
        max_iterations: Option<u32>,
    ) -> Result<Self, crate::error::GatewayError> {
        if let Some(n) = max_iterations {
            if n == 0 {
                return Err(crate::error::GatewayError::InvalidConfig(
                    "max_iterations must be >= 1".to_string(),
                ));
            }
            self.max_iterations = n;
        }
        Ok(self)
    }
}
