//! Configuration for the retry executor, cache layer and batch orchestrator.
//!
//! Each section has a validating builder and a serde representation with
//! human-readable durations (`"100ms"`, `"5m"`). Deserialized values are not
//! validated until [`ServiceConfig::from_json`] or [`ServiceConfig::validate`]
//! is called.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use priorauth_authorization::{RetryConfig, ServiceConfig};
//!
//! let retry = RetryConfig::builder().base_delay(Duration::from_millis(10)).build()?;
//! assert_eq!(retry.max_retries(), 3);
//!
//! let config = ServiceConfig::from_json(r#"{ "cache": { "check_ttl": "1m" } }"#)?;
//! assert_eq!(config.cache.check_ttl(), Duration::from_secs(60));
//! assert_eq!(config.batch.max_batch_size(), 100);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::time::Duration;

use priorauth_storage::ConfigError;
use serde::{Deserialize, Serialize};

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_factor() -> u32 {
    2
}

fn default_base_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_entity_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_check_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_true() -> bool {
    true
}

fn default_max_batch_size() -> usize {
    100
}

fn default_parallel_workers() -> usize {
    5
}

fn default_deadline() -> Duration {
    Duration::from_secs(30)
}

fn at_least<T: PartialOrd + std::fmt::Debug>(
    field: &'static str,
    value: T,
    min: T,
) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::BelowMinimum {
            field,
            value: format!("{value:?}"),
            min: format!("{min:?}"),
        });
    }
    Ok(())
}

/// Retry executor settings.
///
/// The delay before retry `n` (zero-based) is
/// `base_delay * backoff_factor^n`, capped at `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    max_retries: u32,

    /// Multiplier applied per retry.
    #[serde(default = "default_backoff_factor")]
    backoff_factor: u32,

    /// Delay before the first retry.
    #[serde(with = "humantime_serde", default = "default_base_delay")]
    base_delay: Duration,

    /// Upper bound on any single delay.
    #[serde(with = "humantime_serde", default = "default_max_backoff")]
    max_backoff: Duration,

    /// Adds up to 50% random jitter to each delay.
    #[serde(default)]
    jitter: bool,
}

#[bon::bon]
impl RetryConfig {
    /// Creates a validated retry configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `backoff_factor` is zero, `base_delay` is
    /// zero, or `max_backoff` is below `base_delay`.
    #[builder]
    pub fn new(
        #[builder(default = default_max_retries())] max_retries: u32,
        #[builder(default = default_backoff_factor())] backoff_factor: u32,
        #[builder(default = default_base_delay())] base_delay: Duration,
        #[builder(default = default_max_backoff())] max_backoff: Duration,
        #[builder(default)] jitter: bool,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_retries, backoff_factor, base_delay, max_backoff, jitter };
        config.validate()?;
        Ok(config)
    }

    /// Checks field invariants.
    ///
    /// # Errors
    ///
    /// See [`RetryConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("retry.backoff_factor", self.backoff_factor, 1)?;
        at_least("retry.base_delay", self.base_delay, Duration::from_millis(1))?;
        at_least("retry.max_backoff", self.max_backoff, self.base_delay)
    }

    /// Retries after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Multiplier applied per retry.
    #[must_use]
    pub fn backoff_factor(&self) -> u32 {
        self.backoff_factor
    }

    /// Delay before the first retry.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Upper bound on any single delay.
    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Whether jitter is added to delays.
    #[must_use]
    pub fn jitter(&self) -> bool {
        self.jitter
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
            base_delay: default_base_delay(),
            max_backoff: default_max_backoff(),
            jitter: false,
        }
    }
}

/// Cache layer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Freshness window for single authorizations.
    #[serde(with = "humantime_serde", default = "default_entity_ttl")]
    entity_ttl: Duration,

    /// Freshness window for coverage-check results.
    #[serde(with = "humantime_serde", default = "default_check_ttl")]
    check_ttl: Duration,

    /// When `false`, every read goes to persistence.
    #[serde(default = "default_true")]
    enabled: bool,
}

#[bon::bon]
impl CacheConfig {
    /// Creates a validated cache configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if either TTL is under one second.
    #[builder]
    pub fn new(
        #[builder(default = default_entity_ttl())] entity_ttl: Duration,
        #[builder(default = default_check_ttl())] check_ttl: Duration,
        #[builder(default = true)] enabled: bool,
    ) -> Result<Self, ConfigError> {
        let config = Self { entity_ttl, check_ttl, enabled };
        config.validate()?;
        Ok(config)
    }

    /// A configuration that bypasses the cache entirely.
    #[must_use]
    pub fn disabled() -> Self {
        Self { enabled: false, ..Self::default() }
    }

    /// Checks field invariants.
    ///
    /// # Errors
    ///
    /// See [`CacheConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("cache.entity_ttl", self.entity_ttl, Duration::from_secs(1))?;
        at_least("cache.check_ttl", self.check_ttl, Duration::from_secs(1))
    }

    /// Freshness window for single authorizations.
    #[must_use]
    pub fn entity_ttl(&self) -> Duration {
        self.entity_ttl
    }

    /// Freshness window for coverage-check results.
    #[must_use]
    pub fn check_ttl(&self) -> Duration {
        self.check_ttl
    }

    /// Whether caching is enabled.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { entity_ttl: default_entity_ttl(), check_ttl: default_check_ttl(), enabled: true }
    }
}

/// Batch orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    /// Largest accepted batch.
    #[serde(default = "default_max_batch_size")]
    max_batch_size: usize,

    /// Worker tasks per batch call.
    #[serde(default = "default_parallel_workers")]
    parallel_workers: usize,

    /// Wall-clock budget for one batch call.
    #[serde(with = "humantime_serde", default = "default_deadline")]
    deadline: Duration,
}

#[bon::bon]
impl BatchConfig {
    /// Creates a validated batch configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::BelowMinimum`] if any field is zero.
    #[builder]
    pub fn new(
        #[builder(default = default_max_batch_size())] max_batch_size: usize,
        #[builder(default = default_parallel_workers())] parallel_workers: usize,
        #[builder(default = default_deadline())] deadline: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_batch_size, parallel_workers, deadline };
        config.validate()?;
        Ok(config)
    }

    /// Checks field invariants.
    ///
    /// # Errors
    ///
    /// See [`BatchConfig::new`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        at_least("batch.max_batch_size", self.max_batch_size, 1)?;
        at_least("batch.parallel_workers", self.parallel_workers, 1)?;
        at_least("batch.deadline", self.deadline, Duration::from_millis(1))
    }

    /// Largest accepted batch.
    #[must_use]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Worker tasks per batch call.
    #[must_use]
    pub fn parallel_workers(&self) -> usize {
        self.parallel_workers
    }

    /// Wall-clock budget for one batch call.
    #[must_use]
    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            parallel_workers: default_parallel_workers(),
            deadline: default_deadline(),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Retry executor settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Cache layer settings.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Batch orchestrator settings.
    #[serde(default)]
    pub batch: BatchConfig,
}

impl ServiceConfig {
    /// Parses and validates a JSON document. Missing sections use defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for malformed JSON or unknown fields,
    /// or the first validation failure.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ConfigError::Invalid { field: "config", reason: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        self.cache.validate()?;
        self.batch.validate()
    }
}
