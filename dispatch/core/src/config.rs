//! TOML Configuration File Support
//!
//! Centralized configuration loading for the dispatch router, from a TOML file
//! at `~/.config/dispatch/dispatch.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`DISPATCH_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [router]
//! use_fallback = true
//! fallback_admission = true
//! token_timeout_ms = 60000
//! permit_timeout_ms = 30000
//! default_model = "anthropic/claude-sonnet-4-5"
//!
//! [retry]
//! max_retries = 3
//! initial_delay_ms = 1000
//! max_delay_ms = 60000
//! factor = 2.0
//!
//! [rate_limits.default]
//! requests_per_minute = 60
//!
//! [rate_limits.anthropic]
//! requests_per_minute = 50
//!
//! [concurrency.mcp]
//! max_concurrent = 2
//! min_time_between_ms = 500
//! reservoir_capacity = 30
//! reservoir_refresh_ms = 60000
//!
//! [[fallback]]
//! provider = "mcp"
//! model = "kimi-k2"
//! priority = 1
//! max_retries = 2
//! retry_delay_ms = 5000
//!
//! [[models]]
//! provider = "mcp"
//! model = "deepseek-coder"
//! capabilities = ["coding", "debugging"]
//! speed = "fast"
//! quality = "high"
//! cost = "low"
//! ```
//!
//! The `default` key under `[rate_limits]` and `[concurrency]` sets the limits
//! for providers without their own entry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::routing::{
    default_candidates, parse_model, ConcurrencyLimits, ConcurrencySettings, ModelProfile,
    ProviderCandidate, RateLimitSettings, ReservoirSettings, RouterSettings,
};

/// Table key that addresses the fallback limits
const DEFAULT_KEY: &str = "default";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Router section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterToml {
    /// Route through the fallback chain
    pub use_fallback: Option<bool>,

    /// Apply admission control to fallback candidates
    pub fallback_admission: Option<bool>,

    /// Rate-limit token wait in milliseconds
    pub token_timeout_ms: Option<u64>,

    /// Concurrency permit wait in milliseconds (unset = wait indefinitely)
    pub permit_timeout_ms: Option<u64>,

    /// Model used when nothing else qualifies (`provider/model`)
    pub default_model: Option<String>,
}

/// Retry section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryToml {
    pub max_retries: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub factor: Option<f64>,
}

/// One `[rate_limits.<provider>]` table
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitToml {
    pub requests_per_minute: Option<u32>,
}

/// One `[concurrency.<provider>]` table
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyToml {
    pub max_concurrent: Option<u32>,

    /// Pause after each grant in milliseconds (0 disables)
    pub min_time_between_ms: Option<u64>,

    /// Reservoir size; requires `reservoir_refresh_ms`
    pub reservoir_capacity: Option<u32>,

    /// Reservoir refill interval; requires `reservoir_capacity`
    pub reservoir_refresh_ms: Option<u64>,
}

/// One `[[fallback]]` entry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CandidateToml {
    pub provider: String,
    pub model: String,
    pub priority: u32,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub use_exponential_backoff: Option<bool>,
}

impl From<&CandidateToml> for ProviderCandidate {
    fn from(entry: &CandidateToml) -> Self {
        let mut candidate =
            ProviderCandidate::new(entry.provider.clone(), entry.model.clone(), entry.priority);
        if let Some(max_retries) = entry.max_retries {
            candidate = candidate.with_max_retries(max_retries);
        }
        if let Some(delay) = entry.retry_delay_ms {
            candidate = candidate.with_retry_delay(Duration::from_millis(delay));
        }
        if let Some(enabled) = entry.use_exponential_backoff {
            candidate = candidate.with_exponential_backoff(enabled);
        }
        candidate
    }
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchToml {
    pub router: RouterToml,
    pub retry: RetryToml,
    pub rate_limits: HashMap<String, RateLimitToml>,
    pub concurrency: HashMap<String, ConcurrencyToml>,
    /// Replaces the built-in chain when non-empty
    pub fallback: Vec<CandidateToml>,
    /// Added to (or replacing entries of) the built-in catalog
    pub models: Vec<ModelProfile>,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the router
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct DispatchConfig {
    pub router: RouterSettings,
    pub rate_limits: RateLimitSettings,
    pub concurrency: ConcurrencySettings,
    /// Fallback chain candidates
    pub fallback: Vec<ProviderCandidate>,
    /// Catalog extensions
    pub models: Vec<ModelProfile>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source that last changed a value
    source: ConfigSource,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            router: RouterSettings::default(),
            rate_limits: RateLimitSettings::default(),
            concurrency: ConcurrencySettings::default(),
            fallback: default_candidates(),
            models: Vec::new(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl DispatchConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check every value the router relies on
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limits.default_requests_per_minute == 0 {
            return Err(invalid("rate_limits.default.requests_per_minute must be > 0"));
        }
        for (provider, rpm) in &self.rate_limits.providers {
            if *rpm == 0 {
                return Err(invalid(format!(
                    "rate_limits.{provider}.requests_per_minute must be > 0"
                )));
            }
        }

        let limits = std::iter::once((DEFAULT_KEY, &self.concurrency.default_limits)).chain(
            self.concurrency
                .providers
                .iter()
                .map(|(name, limits)| (name.as_str(), limits)),
        );
        for (provider, limits) in limits {
            if limits.max_concurrent == 0 {
                return Err(invalid(format!(
                    "concurrency.{provider}.max_concurrent must be > 0"
                )));
            }
            if let Some(reservoir) = limits.reservoir {
                if reservoir.capacity == 0 || reservoir.refresh_interval.is_zero() {
                    return Err(invalid(format!(
                        "concurrency.{provider} reservoir capacity and refresh must be > 0"
                    )));
                }
            }
        }

        let backoff = &self.router.backoff;
        if !backoff.factor.is_finite() || backoff.factor < 1.0 {
            return Err(invalid(format!("retry.factor must be >= 1, got {}", backoff.factor)));
        }
        if backoff.initial_delay > backoff.max_delay {
            return Err(invalid("retry.initial_delay_ms must not exceed retry.max_delay_ms"));
        }

        for candidate in &self.fallback {
            if candidate.max_retries == 0 {
                return Err(invalid(format!(
                    "fallback candidate {} must allow at least one attempt",
                    candidate.id()
                )));
            }
        }

        if let Some(model) = &self.router.default_model {
            if parse_model(model).is_none() {
                return Err(invalid(format!(
                    "router.default_model must be provider/model, got {model:?}"
                )));
            }
        }

        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/dispatch/dispatch.toml` or
/// `~/.config/dispatch/dispatch.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("dispatch").join("dispatch.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// merged configuration fails validation. A missing file is not an error.
pub fn load_config() -> Result<DispatchConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read, parsed, or
/// validated.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<DispatchConfig, ConfigError> {
    let mut config = DispatchConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: DispatchToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
///
/// # Errors
///
/// Fails when a reservoir is only half specified.
pub fn apply_toml_config(config: &mut DispatchConfig, toml: &DispatchToml) -> Result<(), ConfigError> {
    // Router settings
    if let Some(enabled) = toml.router.use_fallback {
        config.router.use_fallback = enabled;
    }
    if let Some(enabled) = toml.router.fallback_admission {
        config.router.fallback_admission = enabled;
    }
    if let Some(ms) = toml.router.token_timeout_ms {
        config.router.token_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.router.permit_timeout_ms {
        config.router.permit_timeout = Some(Duration::from_millis(ms));
    }
    if toml.router.default_model.is_some() {
        config.router.default_model = toml.router.default_model.clone();
    }

    // Retry settings
    let backoff = &mut config.router.backoff;
    if let Some(max_retries) = toml.retry.max_retries {
        backoff.max_retries = max_retries;
    }
    if let Some(ms) = toml.retry.initial_delay_ms {
        backoff.initial_delay = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.retry.max_delay_ms {
        backoff.max_delay = Duration::from_millis(ms);
    }
    if let Some(factor) = toml.retry.factor {
        backoff.factor = factor;
    }

    // Rate limits
    for (provider, table) in &toml.rate_limits {
        let Some(rpm) = table.requests_per_minute else {
            continue;
        };
        if provider == DEFAULT_KEY {
            config.rate_limits.default_requests_per_minute = rpm;
        } else {
            config.rate_limits.providers.insert(provider.clone(), rpm);
        }
    }

    // Concurrency, default table first so new providers inherit from it
    if let Some(table) = toml.concurrency.get(DEFAULT_KEY) {
        let merged = merge_concurrency(DEFAULT_KEY, config.concurrency.default_limits, table)?;
        config.concurrency.default_limits = merged;
    }
    for (provider, table) in &toml.concurrency {
        if provider == DEFAULT_KEY {
            continue;
        }
        let base = config.concurrency.limits_for(provider);
        let merged = merge_concurrency(provider, base, table)?;
        config.concurrency.providers.insert(provider.clone(), merged);
    }

    if !toml.fallback.is_empty() {
        config.fallback = toml.fallback.iter().map(ProviderCandidate::from).collect();
    }
    config.models.extend(toml.models.iter().cloned());

    Ok(())
}

fn merge_concurrency(
    provider: &str,
    mut limits: ConcurrencyLimits,
    table: &ConcurrencyToml,
) -> Result<ConcurrencyLimits, ConfigError> {
    if let Some(max) = table.max_concurrent {
        limits.max_concurrent = max;
    }
    if let Some(ms) = table.min_time_between_ms {
        limits.min_time_between = (ms > 0).then(|| Duration::from_millis(ms));
    }
    match (table.reservoir_capacity, table.reservoir_refresh_ms) {
        (Some(capacity), Some(ms)) => {
            limits.reservoir = Some(ReservoirSettings {
                capacity,
                refresh_interval: Duration::from_millis(ms),
            });
        }
        (None, None) => {}
        _ => {
            return Err(invalid(format!(
                "concurrency.{provider}: reservoir_capacity and reservoir_refresh_ms must be set together"
            )));
        }
    }
    Ok(limits)
}

/// Apply environment variable overrides to the config
pub fn apply_env_config(config: &mut DispatchConfig) {
    apply_env_with(config, |key| std::env::var(key).ok());
}

/// Apply overrides read through `lookup` instead of the process environment
pub fn apply_env_with<F>(config: &mut DispatchConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let flag = |value: String| value != "0" && value.to_lowercase() != "false";

    if let Some(value) = lookup("DISPATCH_USE_FALLBACK") {
        config.router.use_fallback = flag(value);
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("DISPATCH_FALLBACK_ADMISSION") {
        config.router.fallback_admission = flag(value);
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("DISPATCH_TOKEN_TIMEOUT_MS") {
        if let Ok(ms) = value.parse::<u64>() {
            config.router.token_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(value) = lookup("DISPATCH_PERMIT_TIMEOUT_MS") {
        if let Ok(ms) = value.parse::<u64>() {
            config.router.permit_timeout = Some(Duration::from_millis(ms));
            config.source = ConfigSource::Env;
        }
    }
    if let Some(model) = lookup("DISPATCH_DEFAULT_MODEL") {
        config.router.default_model = Some(model);
        config.source = ConfigSource::Env;
    }
    if let Some(value) = lookup("DISPATCH_MAX_RETRIES") {
        if let Ok(n) = value.parse::<u32>() {
            config.router.backoff.max_retries = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(value) = lookup("DISPATCH_DEFAULT_RPM") {
        if let Ok(rpm) = value.parse::<u32>() {
            config.rate_limits.default_requests_per_minute = rpm;
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`], then call [`DispatchConfig::validate`].
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub use_fallback: Option<bool>,
    pub fallback_admission: Option<bool>,
    pub default_model: Option<String>,
    pub max_retries: Option<u32>,
    pub token_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_use_fallback(mut self, enabled: bool) -> Self {
        self.use_fallback = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_fallback_admission(mut self, enabled: bool) -> Self {
        self.fallback_admission = Some(enabled);
        self
    }

    #[must_use]
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn with_token_timeout_ms(mut self, ms: u64) -> Self {
        self.token_timeout_ms = Some(ms);
        self
    }

    fn is_empty(&self) -> bool {
        self.use_fallback.is_none()
            && self.fallback_admission.is_none()
            && self.default_model.is_none()
            && self.max_retries.is_none()
            && self.token_timeout_ms.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut DispatchConfig) {
        if self.is_empty() {
            return;
        }
        config.source = ConfigSource::Cli;

        if let Some(enabled) = self.use_fallback {
            config.router.use_fallback = enabled;
        }
        if let Some(enabled) = self.fallback_admission {
            config.router.fallback_admission = enabled;
        }
        if let Some(ref model) = self.default_model {
            config.router.default_model = Some(model.clone());
        }
        if let Some(max_retries) = self.max_retries {
            config.router.backoff.max_retries = max_retries;
        }
        if let Some(ms) = self.token_timeout_ms {
            config.router.token_timeout = Duration::from_millis(ms);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
