//! Concurrent registry of per-key token buckets.

use std::collections::hash_map::{DefaultHasher, Entry};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::bucket::{BucketLimits, TokenBucket};
use super::key::RateLimitKey;

/// Shared handle to a registry entry, valid for the duration of one request.
pub type BucketHandle = Arc<RegistryEntry>;

type Shard = RwLock<HashMap<RateLimitKey, BucketHandle>>;

/// A token bucket together with the time it was last looked up.
pub struct RegistryEntry {
    bucket: Mutex<TokenBucket>,
    /// Nanoseconds since the owning registry's epoch
    last_access: AtomicU64,
}

impl RegistryEntry {
    fn new(bucket: TokenBucket, stamp: u64) -> Self {
        Self {
            bucket: Mutex::new(bucket),
            last_access: AtomicU64::new(stamp),
        }
    }

    /// Try to take a token from this entry's bucket.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    /// Try to take a token as of `now`.
    pub fn allow_at(&self, now: Instant) -> bool {
        self.bucket.lock().allow_at(now)
    }

    /// Tokens currently held by the bucket.
    pub fn tokens(&self) -> f64 {
        self.bucket.lock().tokens()
    }

    fn touch(&self, stamp: u64) {
        // fetch_max keeps racing lookups from moving the stamp backwards.
        self.last_access.fetch_max(stamp, Ordering::Relaxed);
    }

    fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }
}

/// Maps rate limit keys to token buckets.
///
/// Lookups of existing keys take only a shard's read lock. A missing key is
/// inserted under the write lock after re-checking, so exactly one bucket is
/// ever built per key even when many requests race on first contact.
///
/// Lookups stamp `last_access` while holding only the read lock. That is sound
/// because entries are removed exclusively under the write lock in
/// [`evict_idle_at`](Self::evict_idle_at), so a stamp can never land on an entry
/// being removed. Anything that mutates entries outside the write lock must
/// revisit this.
pub struct LimiterRegistry {
    shards: Box<[Shard]>,
    limits: BucketLimits,
    epoch: Instant,
}

impl LimiterRegistry {
    /// Create a single-shard registry.
    pub fn new(limits: BucketLimits) -> Self {
        Self::with_shards(limits, 1)
    }

    /// Create a registry split into `shards` independently locked partitions.
    ///
    /// A shard count of zero is treated as one.
    pub fn with_shards(limits: BucketLimits, shards: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RwLock::new(HashMap::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            shards,
            limits,
            epoch: Instant::now(),
        }
    }

    /// Get the limits used for new buckets.
    pub fn limits(&self) -> BucketLimits {
        self.limits
    }

    /// Get the bucket for `key`, creating a full one if this is a new key.
    pub fn get_or_create(&self, key: &RateLimitKey) -> BucketHandle {
        self.get_or_create_at(key, Instant::now())
    }

    /// Get the bucket for `key` as of `now`.
    pub fn get_or_create_at(&self, key: &RateLimitKey, now: Instant) -> BucketHandle {
        self.get_or_create_with(key, now, |limits| TokenBucket::new_at(*limits, now))
    }

    /// Get the bucket for `key`, building it with `factory` if absent.
    ///
    /// `factory` runs at most once per key, under the shard's write lock.
    pub fn get_or_create_with<F>(
        &self,
        key: &RateLimitKey,
        now: Instant,
        factory: F,
    ) -> BucketHandle
    where
        F: FnOnce(&BucketLimits) -> TokenBucket,
    {
        let shard = self.shard(key);
        let stamp = self.stamp(now);

        {
            let entries = shard.read();
            if let Some(entry) = entries.get(key) {
                entry.touch(stamp);
                return Arc::clone(entry);
            }
        }

        let mut entries = shard.write();
        match entries.entry(key.clone()) {
            Entry::Occupied(occupied) => {
                trace!(key = %key, "Bucket created by a concurrent request");
                let entry = occupied.get();
                entry.touch(stamp);
                Arc::clone(entry)
            }
            Entry::Vacant(vacant) => {
                debug!(
                    key = %key,
                    capacity = self.limits.capacity(),
                    refill_per_second = self.limits.refill_per_second(),
                    "Creating token bucket"
                );
                let entry = Arc::new(RegistryEntry::new(factory(&self.limits), stamp));
                Arc::clone(vacant.insert(entry))
            }
        }
    }

    /// Remove entries idle for longer than `ttl`.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        self.evict_idle_at(ttl, Instant::now())
    }

    /// Remove entries whose last access is older than `now - ttl`.
    ///
    /// Each shard's write lock is held for exactly one pass over that shard.
    /// Returns the number of entries removed.
    pub fn evict_idle_at(&self, ttl: Duration, now: Instant) -> usize {
        let Some(cutoff) = now.checked_sub(ttl) else {
            return 0;
        };
        // A cutoff before the epoch cannot be older than any stamp.
        let Some(cutoff) = cutoff.checked_duration_since(self.epoch) else {
            return 0;
        };
        let cutoff = duration_to_stamp(cutoff);

        let mut evicted = 0;
        for shard in self.shards.iter() {
            let mut entries = shard.write();
            let before = entries.len();
            entries.retain(|_, entry| entry.last_access() >= cutoff);
            evicted += before - entries.len();
        }
        evicted
    }

    /// Check whether `key` currently has an entry.
    pub fn contains(&self, key: &RateLimitKey) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Get the number of tracked keys.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    /// Check whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|shard| shard.read().is_empty())
    }

    /// Remove every entry.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }

    fn shard(&self, key: &RateLimitKey) -> &Shard {
        if self.shards.len() == 1 {
            return &self.shards[0];
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    fn stamp(&self, now: Instant) -> u64 {
        duration_to_stamp(now.saturating_duration_since(self.epoch))
    }
}

fn duration_to_stamp(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
