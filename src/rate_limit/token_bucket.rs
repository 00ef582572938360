use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, LimiterConfig};
use crate::rate_limit::store::{AcquireArgs, BucketKeys, CounterStore};
use crate::rate_limit::RateLimiter;
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Fixed backoff between attempts while waiting for tokens.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default lifetime of the local reserve, before the per-rate cap.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(100);

/// Default number of extra tokens reserved per remote acquisition.
pub const DEFAULT_PREFETCH: u32 = 4;

/// Longest local reserve lifetime allowed for `rate`: half the time one token
/// takes to refill.
pub fn max_cache_ttl(rate: f64) -> Duration {
    Duration::try_from_secs_f64(0.5 / rate).unwrap_or(Duration::MAX)
}

#[derive(Debug, Default)]
struct LocalCache {
    /// Tokens already deducted from the store and not yet handed out.
    reserve: f64,
    /// `None` until the first reservation.
    written_at: Option<u64>,
}

/// Distributed token bucket for one namespace.
///
/// The authoritative bucket lives in the shared [`CounterStore`] and is only
/// ever changed through the store's atomic acquisition script. A remote
/// acquisition may deduct up to `prefetch` extra tokens, which this instance
/// then hands out locally for `cache_ttl` without a round trip. Local grants
/// therefore never exceed what the store has already deducted; a reserve that
/// expires unspent is simply dropped. A `cache_ttl` of zero disables the local
/// tier.
pub struct TokenBucketLimiter<S> {
    store: Arc<S>,
    namespace: String,
    keys: BucketKeys,
    rate: f64,
    capacity: f64,
    cache_ttl: Duration,
    prefetch: u32,
    cache: Mutex<LocalCache>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl<S> std::fmt::Debug for TokenBucketLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("namespace", &self.namespace)
            .field("rate", &self.rate)
            .field("capacity", &self.capacity)
            .field("cache_ttl", &self.cache_ttl)
            .field("prefetch", &self.prefetch)
            .finish()
    }
}

impl<S> TokenBucketLimiter<S>
where
    S: CounterStore + 'static,
{
    /// Create a limiter for `config.namespace` backed by `store`.
    ///
    /// # Errors
    /// Returns `Err` if the rate, capacity or namespace is invalid.
    pub fn new(store: Arc<S>, config: LimiterConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut limiter = Self {
            store,
            keys: BucketKeys::for_namespace(&config.namespace),
            namespace: config.namespace,
            rate: config.rate,
            capacity: config.capacity,
            cache_ttl: Duration::ZERO,
            prefetch: DEFAULT_PREFETCH,
            cache: Mutex::new(LocalCache::default()),
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
        };
        limiter.set_cache_ttl(DEFAULT_CACHE_TTL);
        Ok(limiter)
    }

    /// Override how long a local reserve may be spent.
    ///
    /// Values above [`max_cache_ttl`] for this bucket's rate are capped.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.set_cache_ttl(ttl);
        self
    }

    /// Override how many extra tokens a remote acquisition reserves.
    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub(crate) fn set_cache_ttl(&mut self, ttl: Duration) {
        let max = max_cache_ttl(self.rate);
        if ttl > max {
            tracing::debug!(
                namespace = %self.namespace,
                requested_ms = ttl.as_millis() as u64,
                capped_ms = max.as_millis() as u64,
                "cache ttl capped to half the refill interval"
            );
        }
        self.cache_ttl = ttl.min(max);
        self.invalidate_cache();
    }

    pub(crate) fn set_prefetch(&mut self, prefetch: u32) {
        self.prefetch = prefetch;
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Override the poll backoff sleeper.
    pub fn with_sleeper<Z: Sleeper + 'static>(mut self, sleeper: Z) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub(crate) fn set_time_source(&mut self, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) {
        self.clock = clock;
        self.sleeper = sleeper;
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Effective local reserve lifetime, after capping.
    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    pub fn prefetch(&self) -> u32 {
        self.prefetch
    }

    /// Try to take `tokens` from the bucket.
    ///
    /// Attempts the local reserve first, then the shared store. With a
    /// non-zero `timeout`, keeps retrying every [`POLL_INTERVAL`] until the
    /// timeout elapses. Store failures count as failed attempts.
    pub async fn acquire(&self, tokens: u32, timeout: Duration) -> bool {
        let requested = f64::from(tokens);
        if requested > self.capacity {
            tracing::debug!(
                namespace = %self.namespace,
                requested,
                capacity = self.capacity,
                "request exceeds bucket capacity"
            );
            return false;
        }

        let budget = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let start = self.clock.now_millis();

        loop {
            if self.try_acquire_local(requested) {
                return true;
            }
            if self.try_acquire_remote(requested).await {
                return true;
            }

            let elapsed = self.clock.now_millis().saturating_sub(start);
            if elapsed >= budget {
                tracing::debug!(namespace = %self.namespace, requested, "tokens unavailable");
                return false;
            }
            let wait = POLL_INTERVAL.min(Duration::from_millis(budget - elapsed));
            self.sleeper.sleep(wait).await;
        }
    }

    fn is_fresh(&self, cache: &LocalCache, now: u64) -> bool {
        match cache.written_at {
            Some(at) => u128::from(now.saturating_sub(at)) < self.cache_ttl.as_millis(),
            None => false,
        }
    }

    fn try_acquire_local(&self, requested: f64) -> bool {
        let now = self.clock.now_millis();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_fresh(&cache, now) && cache.reserve >= requested {
            cache.reserve -= requested;
            return true;
        }
        false
    }

    async fn try_acquire_remote(&self, requested: f64) -> bool {
        let prefetch = if self.cache_ttl.is_zero() { 0 } else { self.prefetch };
        let args = AcquireArgs {
            rate: self.rate,
            capacity: self.capacity,
            now: self.clock.now_secs(),
            requested,
            prefetch,
        };
        match self.store.eval_acquire(&self.keys, args).await {
            Ok(Some(reserved)) => {
                if reserved > 0 {
                    self.add_reserve(reserved);
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::error!(
                    namespace = %self.namespace,
                    error = %e,
                    "counter store acquisition failed"
                );
                false
            }
        }
    }

    /// Bank tokens the store just deducted for us.
    fn add_reserve(&self, reserved: u32) {
        let now = self.clock.now_millis();
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.is_fresh(&cache, now) {
            cache.reserve = 0.0;
        }
        cache.reserve += f64::from(reserved);
        cache.written_at = Some(now);
    }

    /// Unspent reserve that may still be handed out.
    fn live_reserve(&self) -> f64 {
        let now = self.clock.now_millis();
        let cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_fresh(&cache, now) {
            cache.reserve
        } else {
            0.0
        }
    }

    fn invalidate_cache(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        *cache = LocalCache::default();
    }

    /// Last stored token count plus this instance's unspent reserve, without
    /// applying refill.
    ///
    /// Returns `capacity` for a bucket nobody has touched yet and `0.0` when
    /// the store cannot be read.
    pub async fn get_token_count(&self) -> f64 {
        match self.store.get(&self.keys.tokens).await {
            Ok(Some(raw)) => match raw.parse::<f64>() {
                Ok(stored) => stored + self.live_reserve(),
                Err(_) => {
                    tracing::error!(namespace = %self.namespace, value = %raw, "malformed token count");
                    0.0
                }
            },
            Ok(None) => self.capacity,
            Err(e) => {
                tracing::error!(namespace = %self.namespace, error = %e, "failed to read token count");
                0.0
            }
        }
    }

    /// Refill the bucket to capacity and drop the local reserve.
    ///
    /// Administrative path; not used while serving requests.
    pub async fn reset(&self) -> bool {
        self.invalidate_cache();
        let now = self.clock.now_secs();
        let result = async {
            self.store.set(&self.keys.tokens, self.capacity.to_string()).await?;
            self.store.set(&self.keys.timestamp, now.to_string()).await
        };
        match result.await {
            Ok(()) => {
                tracing::info!(namespace = %self.namespace, capacity = self.capacity, "bucket reset");
                true
            }
            Err(e) => {
                tracing::error!(namespace = %self.namespace, error = %e, "bucket reset failed");
                false
            }
        }
    }
}

#[async_trait]
impl<S> RateLimiter for TokenBucketLimiter<S>
where
    S: CounterStore + 'static,
{
    fn name(&self) -> &str {
        &self.namespace
    }

    async fn acquire(&self, tokens: u32, timeout: Duration) -> bool {
        TokenBucketLimiter::acquire(self, tokens, timeout).await
    }
}
