use crate::error::AdmissionError;
use crate::rate_limit::{Admission, RateLimiter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// A layer that admits requests through a [`RateLimiter`] before calling the inner service.
#[derive(Debug)]
pub struct RateLimitLayer<L> {
    limiter: Arc<L>,
    cost: u32,
    timeout: Duration,
}

impl<L> Clone for RateLimitLayer<L> {
    fn clone(&self) -> Self {
        Self { limiter: self.limiter.clone(), cost: self.cost, timeout: self.timeout }
    }
}

impl<L> RateLimitLayer<L> {
    /// One token per request, no waiting.
    pub fn new(limiter: L) -> Self {
        Self::from_shared(Arc::new(limiter))
    }

    /// Share a limiter that is also used elsewhere.
    pub fn from_shared(limiter: Arc<L>) -> Self {
        Self { limiter, cost: 1, timeout: Duration::ZERO }
    }

    /// Tokens charged per request.
    pub fn with_cost(mut self, cost: u32) -> Self {
        self.cost = cost;
        self
    }

    /// How long a request may wait for tokens before it is denied.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl<S, L> Layer<S> for RateLimitLayer<L>
where
    L: RateLimiter + 'static,
{
    type Service = RateLimitService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        RateLimitService {
            inner: service,
            limiter: self.limiter.clone(),
            cost: self.cost,
            timeout: self.timeout,
        }
    }
}

/// Middleware service that enforces admission.
#[derive(Debug)]
pub struct RateLimitService<S, L> {
    inner: S,
    limiter: Arc<L>,
    cost: u32,
    timeout: Duration,
}

impl<S: Clone, L> Clone for RateLimitService<S, L> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            limiter: self.limiter.clone(),
            cost: self.cost,
            timeout: self.timeout,
        }
    }
}

impl<S, L, Req> Service<Req> for RateLimitService<S, L>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    L: RateLimiter + 'static,
    Req: Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let (cost, timeout) = (self.cost, self.timeout);
        // Take the service that was driven to readiness, leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            match limiter.admit(cost, timeout).await {
                Admission::Admitted => inner.call(req).await.map_err(AdmissionError::Inner),
                Admission::Denied { limiter } => Err(AdmissionError::RateLimited { limiter }),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::LimiterConfig;
    use crate::rate_limit::{InMemoryCounterStore, TokenBucketLimiter};
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::{service_fn, ServiceExt};

    #[tokio::test]
    async fn denies_once_bucket_is_empty_and_skips_inner() {
        let store = Arc::new(InMemoryCounterStore::new());
        let bucket = TokenBucketLimiter::new(store, LimiterConfig::new("api", 0.001, 2.0).unwrap())
            .unwrap()
            .with_cache_ttl(Duration::ZERO)
            .with_clock(ManualClock::new(1_000_000));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let svc = RateLimitLayer::new(bucket).layer(service_fn(move |req: u32| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Infallible>(req * 2)
            }
        }));

        assert_eq!(svc.clone().oneshot(1).await.unwrap(), 2);
        assert_eq!(svc.clone().oneshot(2).await.unwrap(), 4);
        let err = svc.clone().oneshot(3).await.unwrap_err();
        assert!(err.is_rate_limited());
        assert_eq!(err.limiter(), Some("api"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cost_is_charged_per_request() {
        let store = Arc::new(InMemoryCounterStore::new());
        let bucket = Arc::new(
            TokenBucketLimiter::new(store, LimiterConfig::new("api", 0.001, 10.0).unwrap())
                .unwrap()
                .with_cache_ttl(Duration::ZERO)
                .with_clock(ManualClock::new(1_000_000)),
        );
        let svc = RateLimitLayer::from_shared(bucket.clone())
            .with_cost(4)
            .layer(service_fn(|_: ()| async { Ok::<_, Infallible>(()) }));

        svc.clone().oneshot(()).await.unwrap();
        svc.clone().oneshot(()).await.unwrap();
        assert!(svc.clone().oneshot(()).await.unwrap_err().is_rate_limited());
        assert_eq!(bucket.get_token_count().await, 2.0);
    }
}
