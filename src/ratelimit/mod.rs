//! Rate limiting logic and state management.

mod bucket;
mod evictor;
mod key;
mod limiter;
mod registry;

pub use bucket::{BucketLimits, TokenBucket};
pub use evictor::{Evictor, EvictorHandle};
pub use key::{derive_key, RateLimitKey, UNKNOWN_KEY};
pub use limiter::{
    Decision, RateLimiter, RateLimiterOptions, DEFAULT_BURST, DEFAULT_CLEANUP_INTERVAL,
    DEFAULT_INACTIVE_TTL, DEFAULT_REQUESTS_PER_SECOND,
};
pub use registry::{BucketHandle, LimiterRegistry, RegistryEntry};
