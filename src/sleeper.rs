//! Abstraction for sleeping/waiting.
//!
//! Enables fast, deterministic tests without real time delays, and lets
//! retry backoff sleeps race against cancellation.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of a cancellable sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The full duration elapsed.
    Completed,
    /// The cancellation token fired first.
    Cancelled,
}

/// Abstraction for sleeping/waiting.
#[async_trait]
pub trait Sleeper: Send + Sync + std::fmt::Debug {
    async fn sleep(&self, duration: Duration);

    /// Sleep, but return early if `token` is cancelled.
    async fn sleep_cancellable(&self, duration: Duration, token: &CancellationToken) -> SleepOutcome {
        tokio::select! {
            _ = self.sleep(duration) => SleepOutcome::Completed,
            _ = token.cancelled() => SleepOutcome::Cancelled,
        }
    }
}

/// Production sleeper using the tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

/// Test sleeper that doesn't actually sleep.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstantSleeper;

#[async_trait]
impl Sleeper for InstantSleeper {
    async fn sleep(&self, _duration: Duration) {
        // no-op
    }
}

/// Test sleeper that records every requested duration.
#[derive(Debug, Clone)]
pub struct TrackingSleeper {
    calls: Arc<Mutex<Vec<Duration>>>,
}

impl Default for TrackingSleeper {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingSleeper {
    pub fn new() -> Self {
        Self { calls: Arc::new(Mutex::new(Vec::new())) }
    }

    /// All recorded sleep durations, in call order.
    pub fn calls(&self) -> Vec<Duration> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
    }

    pub fn call_at(&self, index: usize) -> Option<Duration> {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).get(index).copied()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
    }
}

#[async_trait]
impl Sleeper for TrackingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn instant_sleeper_doesnt_sleep() {
        let sleeper = InstantSleeper;
        let start = std::time::Instant::now();
        sleeper.sleep(Duration::from_secs(10)).await;
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn tracking_sleeper_records_calls_in_order() {
        let sleeper = TrackingSleeper::new();
        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.sleep(Duration::from_millis(200)).await;
        assert_eq!(sleeper.calls(), vec![Duration::from_millis(100), Duration::from_millis(200)]);
        assert_eq!(sleeper.call_at(1), Some(Duration::from_millis(200)));
    }

    #[tokio::test]
    async fn tracking_sleeper_can_clear() {
        let sleeper = TrackingSleeper::new();
        sleeper.sleep(Duration::from_millis(100)).await;
        sleeper.clear();
        assert!(sleeper.calls().is_empty());
    }

    #[tokio::test]
    async fn cancellable_sleep_returns_cancelled_when_token_fires_first() {
        let sleeper = TokioSleeper;
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move { child.cancel() });
        let outcome = sleeper.sleep_cancellable(Duration::from_secs(10), &token).await;
        assert_eq!(outcome, SleepOutcome::Cancelled);
    }

    #[tokio::test]
    async fn cancellable_sleep_completes_when_not_cancelled() {
        let sleeper = InstantSleeper;
        let token = CancellationToken::new();
        let outcome = sleeper.sleep_cancellable(Duration::from_millis(1), &token).await;
        assert_eq!(outcome, SleepOutcome::Completed);
    }
}
