//! Configuration management
//!
//! This module handles loading, validation, and management of the colgen configuration.
//! Configuration is stored in TOML format at ~/.colgen/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory, optional column catalog override
//! - **scheduler**: Concurrency ceiling, global budget, status polling
//! - **batch**: Defaults for new batch operations
//! - **safety**: Defaults for the per-operation safety policy
//! - **provider**: Generation provider endpoint, models and pricing
//!
//! # Examples
//!
//! ```no_run
//! use colgen_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Data dir: {:?}", config.core.data_dir);
//! println!("Concurrency ceiling: {}", config.scheduler.max_concurrent_operations);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use sdk::types::{OperationConfig, ProcessingOrder, SafetyPolicy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Operation scheduler settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Defaults applied to every new batch operation
    #[serde(default)]
    pub batch: BatchDefaults,

    /// Defaults for the per-operation safety policy
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Generation provider settings
    #[serde(default)]
    pub provider: ProviderConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Column catalog override; the built-in catalog is used when unset
    #[serde(default)]
    pub columns_file: Option<PathBuf>,
}

/// Operation scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of non-terminal operations at once
    #[serde(default = "default_max_concurrent_operations")]
    pub max_concurrent_operations: usize,

    /// System-wide spend ceiling across all operations
    #[serde(default)]
    pub global_budget_limit: Option<f64>,

    /// How often `colgen run` polls the status aggregator
    #[serde(default = "default_status_poll_interval")]
    pub status_poll_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_operations: default_max_concurrent_operations(),
            global_budget_limit: None,
            status_poll_interval_secs: default_status_poll_interval(),
        }
    }
}

/// Batch operation defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchDefaults {
    /// Sleep between batches in milliseconds
    #[serde(default = "default_delay_between_batches_ms")]
    pub delay_between_batches_ms: u64,

    /// Terms processed concurrently within one batch
    #[serde(default = "default_max_parallel_terms")]
    pub max_parallel_terms: usize,

    /// Per-operation budget
    #[serde(default = "default_budget_limit")]
    pub budget_limit: f64,

    /// Skip terms that already hold accepted content
    #[serde(default)]
    pub skip_existing: bool,

    /// Processing order of the term catalog
    #[serde(default)]
    pub order: ProcessingOrder,
}

impl Default for BatchDefaults {
    fn default() -> Self {
        Self {
            delay_between_batches_ms: default_delay_between_batches_ms(),
            max_parallel_terms: default_max_parallel_terms(),
            budget_limit: default_budget_limit(),
            skip_existing: false,
            order: ProcessingOrder::TopDown,
        }
    }
}

/// Safety policy defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Error rate that trips the breaker (0.0-1.0)
    #[serde(default = "default_max_error_rate")]
    pub max_error_rate: f64,

    /// Ceiling on a single term's estimated cost
    #[serde(default = "default_max_cost_per_term")]
    pub max_cost_per_term: f64,

    /// Hold new operations in queued until approved
    #[serde(default)]
    pub require_approval: bool,

    /// Publish a notice when an operation terminates
    #[serde(default = "default_true")]
    pub notify_on_completion: bool,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            max_error_rate: default_max_error_rate(),
            max_cost_per_term: default_max_cost_per_term(),
            require_approval: false,
            notify_on_completion: true,
        }
    }
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the chat completions API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable holding the API key; the OS keychain is the fallback
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for generation, evaluation and improvement
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Model used on a term's final retry attempt
    #[serde(default = "default_fallback_model")]
    pub fallback_model: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// USD per 1K prompt tokens
    #[serde(default = "default_prompt_cost")]
    pub prompt_cost_per_1k: f64,

    /// USD per 1K completion tokens
    #[serde(default = "default_completion_cost")]
    pub completion_cost_per_1k: f64,

    /// Content shorter than this is rejected as a retryable failure
    #[serde(default = "default_min_content_chars")]
    pub min_content_chars: usize,

    /// Model per column capability hint; unmapped hints use `default_model`
    #[serde(default)]
    pub capability_models: BTreeMap<String, String>,
    // Note: API key is never stored in config
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            fallback_model: default_fallback_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout_secs: default_request_timeout(),
            prompt_cost_per_1k: default_prompt_cost(),
            completion_cost_per_1k: default_completion_cost(),
            min_content_chars: default_min_content_chars(),
            capability_models: BTreeMap::new(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.colgen")
}

fn default_max_concurrent_operations() -> usize {
    3
}

fn default_status_poll_interval() -> u64 {
    2
}

fn default_delay_between_batches_ms() -> u64 {
    2_000
}

fn default_max_parallel_terms() -> usize {
    1
}

fn default_budget_limit() -> f64 {
    10.0
}

fn default_max_error_rate() -> f64 {
    0.10
}

fn default_max_cost_per_term() -> f64 {
    1.0
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_model() -> String {
    "gpt-4.1-nano".to_string()
}

fn default_fallback_model() -> Option<String> {
    Some("gpt-3.5-turbo".to_string())
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    800
}

fn default_request_timeout() -> u64 {
    60
}

fn default_prompt_cost() -> f64 {
    0.0001
}

fn default_completion_cost() -> f64 {
    0.0004
}

fn default_min_content_chars() -> usize {
    10
}

impl Config {
    /// Load configuration from the default location (~/.colgen/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let default = Self::default_config();

        let toml_string = toml::to_string_pretty(&default)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = default;
        config.validate_and_process()?;
        Ok(config)
    }

    /// Get the default configuration file path (~/.colgen/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".colgen").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
                columns_file: None,
            },
            scheduler: SchedulerConfig::default(),
            batch: BatchDefaults::default(),
            safety: SafetyConfig::default(),
            provider: ProviderConfig::default(),
        }
    }

    /// Path of the SQLite database inside the data directory
    pub fn db_path(&self) -> PathBuf {
        self.core.data_dir.join("colgen.db")
    }

    /// Build the `OperationConfig` a new operation starts from
    ///
    /// Column-specific values (batch size, threshold, retry limit) stay
    /// unset so the registry entry supplies them.
    pub fn operation_defaults(&self) -> OperationConfig {
        OperationConfig {
            delay_between_batches_ms: self.batch.delay_between_batches_ms,
            budget_limit: self.batch.budget_limit,
            skip_existing: self.batch.skip_existing,
            max_parallel_terms: self.batch.max_parallel_terms,
            order: self.batch.order,
            temperature: Some(self.provider.temperature),
            max_tokens: Some(self.provider.max_tokens),
            safety: SafetyPolicy {
                max_error_rate: self.safety.max_error_rate,
                max_cost_per_term: self.safety.max_cost_per_term,
                require_approval: self.safety.require_approval,
                notify_on_completion: self.safety.notify_on_completion,
            },
            ..OperationConfig::default()
        }
    }

    /// Validate and process configuration
    ///
    /// Checks ranges, expands ~ in paths and creates the data directory.
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        if self.scheduler.max_concurrent_operations == 0 {
            return Err(EngineError::Config(
                "max_concurrent_operations must be at least 1".to_string(),
            ));
        }

        if let Some(limit) = self.scheduler.global_budget_limit {
            if limit < 0.0 {
                return Err(EngineError::Config(
                    "global_budget_limit must not be negative".to_string(),
                ));
            }
        }

        if self.batch.max_parallel_terms == 0 {
            return Err(EngineError::Config(
                "max_parallel_terms must be at least 1".to_string(),
            ));
        }

        if self.batch.budget_limit < 0.0 {
            return Err(EngineError::Config(
                "budget_limit must not be negative".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.safety.max_error_rate) {
            return Err(EngineError::Config(
                "max_error_rate must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.safety.max_cost_per_term < 0.0 {
            return Err(EngineError::Config(
                "max_cost_per_term must not be negative".to_string(),
            ));
        }

        if self.provider.prompt_cost_per_1k < 0.0 || self.provider.completion_cost_per_1k < 0.0 {
            return Err(EngineError::Config(
                "provider token prices must not be negative".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.provider.temperature) {
            return Err(EngineError::Config(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        if let Some(columns_file) = &self.core.columns_file {
            self.core.columns_file = Some(expand_path(columns_file)?);
        }

        if !self.core.data_dir.exists() {
            fs::create_dir_all(&self.core.data_dir).map_err(|e| {
                EngineError::Config(format!("Failed to create data directory: {}", e))
            })?;
        }

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
