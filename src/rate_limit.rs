//! Admission control primitives.
//!
//! - [`TokenBucketLimiter`]: one namespace's bucket, kept in a shared
//!   [`CounterStore`] with a short-lived local reserve of pre-deducted tokens.
//! - [`MultiLevelLimiter`]: an ordered chain of buckets (per-IP, per-user,
//!   global, ...) that admits only when every level admits.
//! - [`RateLimitLayer`]: Tower middleware that asks a [`RateLimiter`] before
//!   forwarding a request.
//!
//! # Architecture
//!
//! - **Middleware** doesn't know *how* limiting works, only that it should ask a `RateLimiter`.
//! - **Logic** lives in the limiters: lazy refill arithmetic, local cache, poll-until-timeout.
//! - **Storage** is behind `CounterStore`, so the bucket can live in-process for tests or in a
//!   Redis-class store shared by every server process.

use std::time::Duration;

pub mod middleware;
pub mod multi_level;
pub mod store;
pub mod token_bucket;

pub use middleware::{RateLimitLayer, RateLimitService};
pub use multi_level::MultiLevelLimiter;
pub use store::{CounterStore, InMemoryCounterStore, StoreError, ACQUIRE_SCRIPT};
pub use token_bucket::TokenBucketLimiter;

/// Result of asking a limiter for admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The request may proceed.
    Admitted,
    /// The request is denied.
    Denied {
        /// Namespace of the level that said no.
        limiter: String,
    },
}

impl Admission {
    /// Helper to check if admitted.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted)
    }
}

/// Core interface for admission decisions.
///
/// A denial, a timeout and an unreachable store all look the same to the
/// caller: `false`. Limiters never fail open.
#[async_trait::async_trait]
pub trait RateLimiter: Send + Sync {
    /// Name used in logs and denial reports.
    fn name(&self) -> &str;

    /// Try to take `tokens`, polling for at most `timeout`.
    async fn acquire(&self, tokens: u32, timeout: Duration) -> bool;

    /// Like [`acquire`](Self::acquire) but reports which level denied.
    async fn admit(&self, tokens: u32, timeout: Duration) -> Admission {
        if self.acquire(tokens, timeout).await {
            Admission::Admitted
        } else {
            Admission::Denied { limiter: self.name().to_string() }
        }
    }
}
