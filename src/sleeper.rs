//! Abstraction for the poll backoff inside `acquire`.
//!
//! Production code waits on the tokio timer; tests swap in a sleeper that moves
//! a [`ManualClock`] forward so timeout loops finish instantly and deterministically.

use crate::clock::ManualClock;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Abstraction for sleeping/waiting
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>>;
}

/// Production sleeper using tokio runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Sleeper that advances a [`ManualClock`] instead of waiting, recording every call.
#[derive(Debug, Clone)]
pub struct ClockSleeper {
    clock: ManualClock,
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl ClockSleeper {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock, calls: Arc::new(Mutex::new(Vec::new())) }
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Sum of all recorded sleeps.
    pub fn total(&self) -> Duration {
        self.calls().iter().sum()
    }
}

impl Sleeper for ClockSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(duration);
        self.clock.advance(duration);
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;

    #[tokio::test]
    async fn clock_sleeper_advances_clock_and_records() {
        let clock = ManualClock::new(0);
        let sleeper = ClockSleeper::new(clock.clone());

        sleeper.sleep(Duration::from_millis(10)).await;
        sleeper.sleep(Duration::from_millis(25)).await;

        assert_eq!(clock.now_millis(), 35);
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(10), Duration::from_millis(25)]);
        assert_eq!(sleeper.total(), Duration::from_millis(35));
    }

    #[tokio::test]
    async fn tokio_sleeper_actually_sleeps() {
        let sleeper = TokioSleeper;
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_millis(50)).await;
        // Small tolerance for timing jitter
        assert!(start.elapsed() >= Duration::from_millis(45));
    }
}
