//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - carnot.toml (base configuration)
//! - carnot.local.toml (git-ignored local overrides)
//! - Environment variables (CARNOT_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # carnot.toml
//! [execution]
//! batch_size = 1024
//! evaluator = "arrow_native"
//! query_timeout_ms = 30000
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! CARNOT_EXECUTION__BATCH_SIZE=4096
//! CARNOT_LOGGING__LEVEL=trace
//! ```

use crate::exec::EvaluatorKind;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Main configuration struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Executor tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Rows per batch emitted by sources and network sinks.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Which scalar expression evaluator to use.
    #[serde(default)]
    pub evaluator: EvaluatorKind,

    /// Iteration cap for analyzer rule batches.
    #[serde(default = "default_rule_iterations")]
    pub max_rule_iterations: u64,

    /// Per-query execution deadline in milliseconds (0 = no timeout).
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            batch_size: default_batch_size(),
            evaluator: EvaluatorKind::default(),
            max_rule_iterations: default_rule_iterations(),
            query_timeout_ms: default_query_timeout_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, json).
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig { level: default_log_level(), format: default_log_format() }
    }
}

fn default_batch_size() -> usize {
    1024
}

fn default_rule_iterations() -> u64 {
    1024
}

fn default_query_timeout_ms() -> u64 {
    30_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from the default locations.
    ///
    /// Merges in order:
    /// 1. carnot.toml (base configuration)
    /// 2. carnot.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (CARNOT_ prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("carnot.toml"))
            .merge(Toml::file("carnot.local.toml"))
            .merge(Env::prefixed("CARNOT_").split("__"))
            .extract()
    }
}

/// Install the global tracing subscriber from the logging config. Safe to
/// call more than once; later calls are ignored.
pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));
    if config.format == "json" {
        let _ = tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.execution.batch_size, 1024);
        assert_eq!(config.execution.evaluator, EvaluatorKind::VectorNative);
        assert_eq!(config.execution.max_rule_iterations, 1024);
        assert_eq!(config.execution.query_timeout_ms, 30_000);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_evaluator_knob_parses() {
        use figment::providers::Serialized;
        let config: Config = figment::Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Serialized::default("execution.evaluator", "arrow_native"))
            .extract()
            .unwrap();
        assert_eq!(config.execution.evaluator, EvaluatorKind::ArrowNative);
    }
}
