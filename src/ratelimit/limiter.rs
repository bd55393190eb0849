//! Core rate limiter implementation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::{Result, TurnstileError};

use super::bucket::{BucketLimits, TokenBucket};
use super::evictor::Evictor;
use super::key::RateLimitKey;
use super::registry::LimiterRegistry;

/// Default sustained request rate per key.
pub const DEFAULT_REQUESTS_PER_SECOND: f64 = 10.0;
/// Default burst size per key.
pub const DEFAULT_BURST: u32 = 20;
/// Default time between eviction passes.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Default idle time after which a key's bucket is dropped.
pub const DEFAULT_INACTIVE_TTL: Duration = Duration::from_secs(180);

/// Settings for a [`RateLimiter`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterOptions {
    /// Tokens added to each bucket per second
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst: u32,
    /// Time between eviction passes
    pub cleanup_interval: Duration,
    /// Idle time after which a bucket is evicted
    pub inactive_ttl: Duration,
    /// Number of independently locked registry partitions
    pub shards: usize,
}

impl Default for RateLimiterOptions {
    fn default() -> Self {
        Self {
            requests_per_second: DEFAULT_REQUESTS_PER_SECOND,
            burst: DEFAULT_BURST,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            inactive_ttl: DEFAULT_INACTIVE_TTL,
            shards: 1,
        }
    }
}

impl RateLimiterOptions {
    /// Check the options and derive the bucket limits from them.
    pub fn validate(&self) -> Result<BucketLimits> {
        let limits = BucketLimits::new(self.requests_per_second, self.burst)?;

        if self.cleanup_interval.is_zero() {
            return Err(TurnstileError::InvalidLimit(
                "cleanup interval must be greater than zero".to_string(),
            ));
        }
        if self.inactive_ttl.is_zero() {
            return Err(TurnstileError::InvalidLimit(
                "inactive TTL must be greater than zero".to_string(),
            ));
        }
        if self.shards == 0 {
            return Err(TurnstileError::InvalidLimit(
                "shard count must be at least 1".to_string(),
            ));
        }

        Ok(limits)
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed.
    Allowed,
    /// The key has no tokens left.
    Rejected,
}

impl Decision {
    /// Check whether the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

/// The per-key rate limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    registry: Arc<LimiterRegistry>,
    options: RateLimiterOptions,
}

impl RateLimiter {
    /// Create a rate limiter, rejecting options that cannot limit anything.
    pub fn new(options: RateLimiterOptions) -> Result<Self> {
        let limits = options.validate()?;
        let registry = Arc::new(LimiterRegistry::with_shards(limits, options.shards));

        Ok(Self { registry, options })
    }

    /// Check whether a request for `key` is admitted, consuming a token if so.
    ///
    /// Never fails: if the check itself breaks, the request is admitted.
    pub fn check(&self, key: &RateLimitKey) -> Decision {
        self.check_with(key, |limits| TokenBucket::new(*limits))
    }

    /// Check `key`, building its bucket with `factory` if the key is new.
    fn check_with<F>(&self, key: &RateLimitKey, factory: F) -> Decision
    where
        F: FnOnce(&BucketLimits) -> TokenBucket,
    {
        let admitted = catch_unwind(AssertUnwindSafe(|| {
            self.registry
                .get_or_create_with(key, Instant::now(), factory)
                .allow()
        }));

        match admitted {
            Ok(true) => Decision::Allowed,
            Ok(false) => {
                debug!(key = %key, "Rate limit exceeded");
                Decision::Rejected
            }
            Err(_) => {
                error!(key = %key, "Admission check panicked; admitting request");
                Decision::Allowed
            }
        }
    }

    /// Build an evictor for this limiter's registry using the configured timings.
    ///
    /// The evictor is not started; call [`Evictor::spawn`] on it.
    pub fn evictor(&self) -> Evictor {
        Evictor::new(
            Arc::clone(&self.registry),
            self.options.cleanup_interval,
            self.options.inactive_ttl,
        )
    }

    /// Get the underlying registry.
    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    /// Get the options this limiter was built with.
    pub fn options(&self) -> &RateLimiterOptions {
        &self.options
    }

    /// Get the number of tracked keys.
    pub fn bucket_count(&self) -> usize {
        self.registry.len()
    }
}
