//! Configuration types

use crate::{ConfigError, RegionCacheError, RegionCacheResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Property keys recognised by [`RegionConfig::from_properties`].
pub mod property {
    pub const EXPIRATION: &str = "expiration";
    pub const DEFAULT_EXPIRATION: &str = "cache.default_expiration";
    pub const REGION_PREFIX: &str = "regionPrefix";
    pub const REGION_PREFIX_ALT: &str = "region_prefix";
    pub const LOCK_ACQUISITION_TIMEOUT: &str = "lock_acquisition_timeout";
    pub const LOCK_TIMEOUT: &str = "lock_timeout";
    pub const NO_CLEAR: &str = "no_clear";
    pub const VERIFY_LOCK_OWNER: &str = "verify_lock_owner";
    pub const GENERATION_RETRY_LIMIT: &str = "generation_retry_limit";
    pub const OPERATION_TIMEOUT: &str = "operation_timeout";
}

/// Retry configuration for the compare-and-swap and lock polling loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 32,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries immediately, used by tests that want
    /// deterministic timing.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 1.0,
        }
    }

    /// Backoff to wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = f64::from(self.backoff_multiplier).powi(attempt.saturating_sub(1) as i32);
        let scaled = self.initial_backoff.as_nanos() as f64 * factor;
        if !scaled.is_finite() || scaled >= self.max_backoff.as_nanos() as f64 {
            self.max_backoff
        } else {
            Duration::from_nanos(scaled as u64)
        }
    }
}

/// Per-region configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionConfig {
    /// Time-to-live for cache entries.
    pub expiration: Duration,
    /// Namespaces several logical caches sharing one store.
    pub region_prefix: Option<String>,
    /// How long `lock` keeps polling a held lock. Zero means one attempt.
    pub lock_acquisition_timeout: Duration,
    /// How long a lock lives if never released.
    pub lock_timeout: Duration,
    /// Disables `clear` for deployments that never invalidate in bulk.
    pub no_clear: bool,
    /// Makes `unlock_owned` reject releases by a non-owner.
    pub verify_lock_owner: bool,
    /// Upper bound on generation-drift restarts inside one operation.
    pub generation_retry_limit: u32,
    pub cas_retry: RetryPolicy,
    /// Deadline applied to every public operation.
    pub operation_timeout: Option<Duration>,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(300),
            region_prefix: None,
            lock_acquisition_timeout: Duration::ZERO,
            lock_timeout: Duration::from_secs(30),
            no_clear: false,
            verify_lock_owner: false,
            generation_retry_limit: 16,
            cas_retry: RetryPolicy::default(),
            operation_timeout: None,
        }
    }
}

impl RegionConfig {
    /// Create a new region config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.region_prefix = if prefix.is_empty() { None } else { Some(prefix) };
        self
    }

    pub fn with_lock_acquisition_timeout(mut self, timeout: Duration) -> Self {
        self.lock_acquisition_timeout = timeout;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_no_clear(mut self, no_clear: bool) -> Self {
        self.no_clear = no_clear;
        self
    }

    pub fn with_verify_lock_owner(mut self, verify: bool) -> Self {
        self.verify_lock_owner = verify;
        self
    }

    pub fn with_generation_retry_limit(mut self, limit: u32) -> Self {
        self.generation_retry_limit = limit;
        self
    }

    pub fn with_cas_retry(mut self, policy: RetryPolicy) -> Self {
        self.cas_retry = policy;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Build a config from provider-style string properties.
    ///
    /// Unknown keys are ignored. `expiration` wins over
    /// `cache.default_expiration` when both are present.
    pub fn from_properties(props: &HashMap<String, String>) -> RegionCacheResult<Self> {
        let mut config = Self::default();

        let expiration = props
            .get(property::EXPIRATION)
            .or_else(|| props.get(property::DEFAULT_EXPIRATION));
        if let Some(raw) = expiration {
            config.expiration = Duration::from_secs(parse_property(property::EXPIRATION, raw)?);
        }

        let prefix = props
            .get(property::REGION_PREFIX)
            .or_else(|| props.get(property::REGION_PREFIX_ALT));
        if let Some(prefix) = prefix {
            config = config.with_prefix(prefix.clone());
        }

        if let Some(raw) = props.get(property::LOCK_ACQUISITION_TIMEOUT) {
            config.lock_acquisition_timeout =
                Duration::from_secs(parse_property(property::LOCK_ACQUISITION_TIMEOUT, raw)?);
        }
        if let Some(raw) = props.get(property::LOCK_TIMEOUT) {
            config.lock_timeout = Duration::from_secs(parse_property(property::LOCK_TIMEOUT, raw)?);
        }
        if let Some(raw) = props.get(property::NO_CLEAR) {
            config.no_clear = parse_flag(property::NO_CLEAR, raw)?;
        }
        if let Some(raw) = props.get(property::VERIFY_LOCK_OWNER) {
            config.verify_lock_owner = parse_flag(property::VERIFY_LOCK_OWNER, raw)?;
        }
        if let Some(raw) = props.get(property::GENERATION_RETRY_LIMIT) {
            config.generation_retry_limit = parse_property(property::GENERATION_RETRY_LIMIT, raw)?;
        }
        if let Some(raw) = props.get(property::OPERATION_TIMEOUT) {
            config.operation_timeout = Some(Duration::from_millis(parse_property(
                property::OPERATION_TIMEOUT,
                raw,
            )?));
        }

        config.validate()?;
        Ok(config)
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `REGIONCACHE_EXPIRATION_SECS`: entry time-to-live (default: 300)
    /// - `REGIONCACHE_REGION_PREFIX`: region prefix (default: none)
    /// - `REGIONCACHE_LOCK_ACQUISITION_TIMEOUT_SECS`: lock polling window (default: 0)
    /// - `REGIONCACHE_LOCK_TIMEOUT_SECS`: lock hold time (default: 30)
    /// - `REGIONCACHE_NO_CLEAR`: disable clear (default: false)
    /// - `REGIONCACHE_VERIFY_LOCK_OWNER`: owner-checked unlock (default: false)
    /// - `REGIONCACHE_OPERATION_TIMEOUT_MS`: per-operation deadline (default: none)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            expiration: env_parse::<u64>("REGIONCACHE_EXPIRATION_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.expiration),
            region_prefix: std::env::var("REGIONCACHE_REGION_PREFIX")
                .ok()
                .filter(|s| !s.is_empty()),
            lock_acquisition_timeout: env_parse::<u64>("REGIONCACHE_LOCK_ACQUISITION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_acquisition_timeout),
            lock_timeout: env_parse::<u64>("REGIONCACHE_LOCK_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.lock_timeout),
            no_clear: std::env::var("REGIONCACHE_NO_CLEAR")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.no_clear),
            verify_lock_owner: std::env::var("REGIONCACHE_VERIFY_LOCK_OWNER")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(defaults.verify_lock_owner),
            generation_retry_limit: defaults.generation_retry_limit,
            cas_retry: defaults.cas_retry,
            operation_timeout: env_parse::<u64>("REGIONCACHE_OPERATION_TIMEOUT_MS")
                .map(Duration::from_millis),
        }
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - expiration and lock_timeout are positive
    /// - retry limits are at least 1
    /// - backoff_multiplier >= 1.0 and initial_backoff <= max_backoff
    /// - region_prefix does not contain the key separator
    pub fn validate(&self) -> RegionCacheResult<()> {
        if self.expiration.is_zero() {
            return Err(invalid("expiration", format!("{:?}", self.expiration), "expiration must be positive"));
        }

        if self.lock_timeout.is_zero() {
            return Err(invalid("lock_timeout", format!("{:?}", self.lock_timeout), "lock_timeout must be positive"));
        }

        if self.generation_retry_limit == 0 {
            return Err(invalid(
                "generation_retry_limit",
                "0".to_string(),
                "generation_retry_limit must be at least 1",
            ));
        }

        if self.cas_retry.max_attempts == 0 {
            return Err(invalid(
                "cas_retry.max_attempts",
                "0".to_string(),
                "max_attempts must be at least 1",
            ));
        }

        if self.cas_retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "cas_retry.backoff_multiplier",
                self.cas_retry.backoff_multiplier.to_string(),
                "backoff_multiplier must be at least 1.0",
            ));
        }

        if self.cas_retry.initial_backoff > self.cas_retry.max_backoff {
            return Err(RegionCacheError::Config(ConfigError::IncompatibleOptions {
                option_a: "cas_retry.initial_backoff".to_string(),
                option_b: "cas_retry.max_backoff".to_string(),
            }));
        }

        if let Some(prefix) = &self.region_prefix {
            if prefix.contains(':') {
                return Err(invalid("region_prefix", prefix.clone(), "region_prefix must not contain ':'"));
            }
        }

        if let Some(timeout) = self.operation_timeout {
            if timeout.is_zero() {
                return Err(invalid("operation_timeout", "0ms".to_string(), "operation_timeout must be positive"));
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, value: String, reason: &str) -> RegionCacheError {
    RegionCacheError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason: reason.to_string(),
    })
}

fn parse_property<T: FromStr>(field: &str, raw: &str) -> RegionCacheResult<T> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(field, raw.to_string(), "not a valid number"))
}

fn parse_flag(field: &str, raw: &str) -> RegionCacheResult<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(invalid(field, raw.to_string(), "expected true or false")),
    }
}

fn env_parse<T: FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|s| s.parse().ok())
}

// =============================================================================
// TESTS
// =============================================================================
