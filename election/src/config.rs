//! Election configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;

pub const DEFAULT_ELECTION_KEY: &str = "MyApp/leader";
pub const DEFAULT_LEASE_TTL_MS: u64 = 10_000;
pub const DEFAULT_RENEWAL_FAILURE_LIMIT: u32 = 3;
pub const DEFAULT_MAX_ATTEMPTS: usize = 10;
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 0;
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 1_000;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ElectionConfig {
    /// Key whose value names the current leader.
    #[serde(default = "default_key")]
    pub key: String,

    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Consecutive failed renewals after which the lease is considered lost.
    #[serde(default = "default_renewal_failure_limit")]
    pub renewal_failure_limit: u32,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            key: default_key(),
            lease_ttl_ms: DEFAULT_LEASE_TTL_MS,
            renewal_failure_limit: DEFAULT_RENEWAL_FAILURE_LIMIT,
            retry: RetryPolicy::default(),
        }
    }
}

impl ElectionConfig {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(Error::Config("election key must not be empty".to_string()));
        }
        if self.lease_ttl_ms == 0 {
            return Err(Error::Config("lease_ttl_ms must be positive".to_string()));
        }
        if self.renewal_failure_limit == 0 {
            return Err(Error::Config(
                "renewal_failure_limit must be at least 1".to_string(),
            ));
        }
        self.retry.validate()
    }
}

/// Bounded retry for claim attempts.
///
/// With the default `initial_backoff_ms = 0` attempts are issued back to
/// back; a positive value switches to exponential backoff capped at
/// `max_backoff_ms`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            ..Self::default()
        }
    }

    /// Delays to sleep between consecutive attempts; yields `max_attempts - 1` items.
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        let gaps = self.max_attempts.saturating_sub(1);
        if self.initial_backoff_ms == 0 {
            return Box::new(std::iter::repeat(Duration::ZERO).take(gaps));
        }
        Box::new(
            ExponentialBackoff::from_millis(2)
                .factor((self.initial_backoff_ms / 2).max(1))
                .max_delay(Duration::from_millis(self.max_backoff_ms))
                .take(gaps),
        )
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn default_key() -> String {
    DEFAULT_ELECTION_KEY.to_string()
}

fn default_lease_ttl_ms() -> u64 {
    DEFAULT_LEASE_TTL_MS
}

fn default_renewal_failure_limit() -> u32 {
    DEFAULT_RENEWAL_FAILURE_LIMIT
}

fn default_max_attempts() -> usize {
    DEFAULT_MAX_ATTEMPTS
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}
