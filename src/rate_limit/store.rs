use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Server-side acquisition script for Redis-compatible stores.
///
/// `KEYS = {bucket, tokens, timestamp}`, `ARGV = {rate, capacity, now, requested, prefetch}`.
/// Returns `0` when the request was denied. Otherwise returns `1 + reserved`,
/// where `reserved` is the whole number of extra tokens (at most `prefetch`)
/// deducted on top of `requested` for the caller's local cache. The whole
/// read-refill-deduct-write sequence runs indivisibly on the server.
pub const ACQUIRE_SCRIPT: &str = r#"
local tokens_key = KEYS[2]
local timestamp_key = KEYS[3]
local rate = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local requested = tonumber(ARGV[4])
local prefetch = tonumber(ARGV[5] or 0)

local tokens = tonumber(redis.call('get', tokens_key) or capacity)
local last_time = tonumber(redis.call('get', timestamp_key) or now)

local elapsed = math.max(0, now - last_time)
local available = math.min(capacity, tokens + (elapsed * rate))

if available >= requested then
    local reserved = math.min(prefetch, math.floor(available - requested))
    redis.call('set', tokens_key, available - requested - reserved)
    redis.call('set', timestamp_key, now)
    return 1 + reserved
end

return 0
"#;

/// The three store keys backing one namespace's bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKeys {
    pub bucket: String,
    pub tokens: String,
    pub timestamp: String,
}

impl BucketKeys {
    pub fn for_namespace(namespace: &str) -> Self {
        let bucket = format!("{}:token_bucket", namespace);
        Self { tokens: format!("{}:tokens", bucket), timestamp: format!("{}:timestamp", bucket), bucket }
    }
}

/// Arguments of one scripted acquisition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcquireArgs {
    /// Tokens per second.
    pub rate: f64,
    pub capacity: f64,
    /// Caller's wall clock, seconds since the epoch.
    pub now: f64,
    pub requested: f64,
    /// Extra whole tokens to reserve for the local cache when they are available.
    pub prefetch: u32,
}

/// Extra tokens reserved by a granted acquisition, given what was available.
pub fn reservation(available: f64, requested: f64, prefetch: u32) -> u32 {
    let spare = (available - requested).max(0.0).floor();
    // prefetch bounds the result, so the cast cannot truncate
    spare.min(f64::from(prefetch)) as u32
}

/// Tokens available at `now` after lazily refilling from `last`.
///
/// A clock that moved backwards refills nothing.
pub fn refill(tokens: f64, last: f64, now: f64, rate: f64, capacity: f64) -> f64 {
    let elapsed = (now - last).max(0.0);
    (tokens + elapsed * rate).min(capacity)
}

/// Abstract shared counter store (e.g. Redis) reachable by every server process.
///
/// Values are stored as strings, mirroring what a network key-value store hands back.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error>;

    async fn set(&self, key: &str, value: String) -> Result<(), Self::Error>;

    /// Run [`ACQUIRE_SCRIPT`] (or an equivalent) atomically.
    ///
    /// Returns `Ok(None)` when denied, and `Ok(Some(reserved))` when
    /// `args.requested + reserved` tokens were deducted.
    async fn eval_acquire(&self, keys: &BucketKeys, args: AcquireArgs) -> Result<Option<u32>, Self::Error>;
}

/// Errors from [`InMemoryCounterStore`].
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store was switched off to simulate an outage.
    #[error("counter store unavailable")]
    Unavailable,
    /// A key held something that is not a number.
    #[error("malformed value at '{key}': {value:?}")]
    Malformed { key: String, value: String },
}

/// In-process counter store. Clones share the same data.
///
/// Every operation runs under one mutex, which makes `eval_acquire` as
/// indivisible as a server-side script.
#[derive(Default, Clone, Debug)]
pub struct InMemoryCounterStore {
    data: Arc<Mutex<HashMap<String, String>>>,
    offline: Arc<AtomicBool>,
    script_calls: Arc<AtomicU64>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle a simulated outage; while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Number of `eval_acquire` calls that reached the store.
    pub fn script_calls(&self) -> u64 {
        self.script_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

fn parse_number(key: &str, raw: Option<&String>, default: f64) -> Result<f64, StoreError> {
    match raw {
        None => Ok(default),
        Some(v) => v
            .parse::<f64>()
            .map_err(|_| StoreError::Malformed { key: key.to_string(), value: v.clone() }),
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    type Error = StoreError;

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        self.check_available()?;
        let guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> Result<(), Self::Error> {
        self.check_available()?;
        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        guard.insert(key.to_string(), value);
        Ok(())
    }

    async fn eval_acquire(&self, keys: &BucketKeys, args: AcquireArgs) -> Result<Option<u32>, Self::Error> {
        self.check_available()?;
        self.script_calls.fetch_add(1, Ordering::SeqCst);

        let mut guard = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        let tokens = parse_number(&keys.tokens, guard.get(&keys.tokens), args.capacity)?;
        let last = parse_number(&keys.timestamp, guard.get(&keys.timestamp), args.now)?;

        let available = refill(tokens, last, args.now, args.rate, args.capacity);
        if available < args.requested {
            return Ok(None);
        }
        let reserved = reservation(available, args.requested, args.prefetch);
        let left = available - args.requested - f64::from(reserved);
        guard.insert(keys.tokens.clone(), left.to_string());
        guard.insert(keys.timestamp.clone(), args.now.to_string());
        Ok(Some(reserved))
    }
}
