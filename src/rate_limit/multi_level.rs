use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigError, FlashSaleConfig, LimiterConfig};
use crate::rate_limit::store::CounterStore;
use crate::rate_limit::token_bucket::{TokenBucketLimiter, DEFAULT_CACHE_TTL, DEFAULT_PREFETCH};
use crate::rate_limit::{Admission, RateLimiter};
use crate::sleeper::{Sleeper, TokioSleeper};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Ordered chain of token buckets sharing one counter store.
///
/// A request is admitted only if every level admits it, checked in
/// registration order. The first denial stops the walk; tokens already taken
/// from earlier levels are not given back.
pub struct MultiLevelLimiter<S> {
    store: Arc<S>,
    levels: Vec<TokenBucketLimiter<S>>,
    cache_ttl: Duration,
    prefetch: u32,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl<S> std::fmt::Debug for MultiLevelLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLevelLimiter").field("levels", &self.levels).finish()
    }
}

impl<S> MultiLevelLimiter<S>
where
    S: CounterStore + 'static,
{
    /// Empty chain; admits everything until a level is added.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            levels: Vec::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
            prefetch: DEFAULT_PREFETCH,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Build the chain described by `config.limiters`, in order.
    pub fn from_config(store: Arc<S>, config: &FlashSaleConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mut chain =
            Self::new(store).with_cache_ttl(config.cache_ttl()).with_prefetch(config.prefetch);
        for level in &config.limiters {
            chain.add_limiter(level.clone())?;
        }
        Ok(chain)
    }

    /// Local reserve lifetime for every level, existing and future.
    ///
    /// Each level caps it by its own rate.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        for level in &mut self.levels {
            level.set_cache_ttl(ttl);
        }
        self
    }

    /// Reservation size for every level, existing and future.
    pub fn with_prefetch(mut self, prefetch: u32) -> Self {
        self.prefetch = prefetch;
        for level in &mut self.levels {
            level.set_prefetch(prefetch);
        }
        self
    }

    /// Override the clock for this chain and every level in it.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self.propagate_time_source();
        self
    }

    /// Override the poll backoff sleeper for this chain and every level in it.
    pub fn with_sleeper<Z: Sleeper + 'static>(mut self, sleeper: Z) -> Self {
        self.sleeper = Arc::new(sleeper);
        self.propagate_time_source();
        self
    }

    fn propagate_time_source(&mut self) {
        for level in &mut self.levels {
            level.set_time_source(self.clock.clone(), self.sleeper.clone());
        }
    }

    /// Append a level at the end of the chain.
    ///
    /// # Errors
    /// Returns `Err` for an invalid config or a namespace already in the chain.
    pub fn add_limiter(&mut self, config: LimiterConfig) -> Result<(), ConfigError> {
        if self.level(&config.namespace).is_some() {
            return Err(ConfigError::DuplicateNamespace(config.namespace));
        }
        let mut level = TokenBucketLimiter::new(self.store.clone(), config)?
            .with_cache_ttl(self.cache_ttl)
            .with_prefetch(self.prefetch);
        level.set_time_source(self.clock.clone(), self.sleeper.clone());
        self.levels.push(level);
        Ok(())
    }

    /// Levels in check order.
    pub fn levels(&self) -> &[TokenBucketLimiter<S>] {
        &self.levels
    }

    /// Look a level up by namespace.
    pub fn level(&self, namespace: &str) -> Option<&TokenBucketLimiter<S>> {
        self.levels.iter().find(|l| l.namespace() == namespace)
    }

    /// Walk the chain, giving each level whatever is left of `timeout`.
    pub async fn admit(&self, tokens: u32, timeout: Duration) -> Admission {
        let start = self.clock.now_millis();
        for level in &self.levels {
            let remaining = if timeout.is_zero() {
                Duration::ZERO
            } else {
                let elapsed = Duration::from_millis(self.clock.now_millis().saturating_sub(start));
                timeout.saturating_sub(elapsed)
            };
            if !level.acquire(tokens, remaining).await {
                tracing::debug!(limiter = %level.namespace(), tokens, "admission denied");
                return Admission::Denied { limiter: level.namespace().to_string() };
            }
        }
        Admission::Admitted
    }

    /// `true` only if every level admitted.
    pub async fn acquire(&self, tokens: u32, timeout: Duration) -> bool {
        self.admit(tokens, timeout).await.is_admitted()
    }
}

#[async_trait]
impl<S> RateLimiter for MultiLevelLimiter<S>
where
    S: CounterStore + 'static,
{
    fn name(&self) -> &str {
        "multi-level"
    }

    async fn acquire(&self, tokens: u32, timeout: Duration) -> bool {
        MultiLevelLimiter::acquire(self, tokens, timeout).await
    }

    async fn admit(&self, tokens: u32, timeout: Duration) -> Admission {
        MultiLevelLimiter::admit(self, tokens, timeout).await
    }
}
