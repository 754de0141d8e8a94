//! Retry rules
//!
//! A retry rule is consulted after a `FAILURE_RETRY` step result to decide
//! whether the runner should attempt the step again, optionally blocking for
//! an interval first. Implementers must not retain global state: a rule
//! instance is owned by exactly one step registration and used serially,
//! never shared across concurrent flights.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

/// Pluggable per-step retry policy.
#[async_trait]
pub trait RetryRule: Send + Sync {
    /// Reset per-attempt state. Called once before the first attempt of a
    /// step within a runner instantiation.
    fn initialize(&mut self);

    /// Called after a `FAILURE_RETRY` result. Returns whether to attempt
    /// again, optionally blocking for an interval first.
    async fn sleep_and_decide(&mut self) -> bool;
}

/// Never retries.
#[derive(Debug, Clone, Default)]
pub struct NoRetry;

#[async_trait]
impl RetryRule for NoRetry {
    fn initialize(&mut self) {}

    async fn sleep_and_decide(&mut self) -> bool {
        false
    }
}

/// Sleeps a fixed interval, then returns true up to `max_count` times.
#[derive(Debug, Clone)]
pub struct FixedInterval {
    interval: Duration,
    max_count: u32,
    attempts: u32,
}

impl FixedInterval {
    pub fn new(interval: Duration, max_count: u32) -> Self {
        Self {
            interval,
            max_count,
            attempts: 0,
        }
    }
}

#[async_trait]
impl RetryRule for FixedInterval {
    fn initialize(&mut self) {
        self.attempts = 0;
    }

    async fn sleep_and_decide(&mut self) -> bool {
        if self.attempts >= self.max_count {
            return false;
        }
        self.attempts += 1;
        tokio::time::sleep(self.interval).await;
        true
    }
}

/// Doubles the interval up to `max_interval` after every attempt; stops once
/// wall-clock time since `initialize` exceeds `total_budget`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max_interval: Duration,
    total_budget: Duration,
    current_interval: Duration,
    started_at: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max_interval: Duration, total_budget: Duration) -> Self {
        Self {
            initial,
            max_interval,
            total_budget,
            current_interval: initial,
            started_at: None,
        }
    }
}

#[async_trait]
impl RetryRule for ExponentialBackoff {
    fn initialize(&mut self) {
        self.current_interval = self.initial;
        self.started_at = Some(Instant::now());
    }

    async fn sleep_and_decide(&mut self) -> bool {
        let started_at = *self.started_at.get_or_insert_with(Instant::now);
        if started_at.elapsed() >= self.total_budget {
            return false;
        }
        tokio::time::sleep(self.current_interval).await;
        self.current_interval = (self.current_interval * 2).min(self.max_interval);
        started_at.elapsed() < self.total_budget
    }
}

/// Sleeps `unit * rand[0, spread)` up to `max_count` times.
#[derive(Debug, Clone)]
pub struct RandomBackoff {
    unit: Duration,
    spread: u32,
    max_count: u32,
    attempts: u32,
}

impl RandomBackoff {
    pub fn new(unit: Duration, spread: u32, max_count: u32) -> Self {
        Self {
            unit,
            spread: spread.max(1),
            max_count,
            attempts: 0,
        }
    }
}

#[async_trait]
impl RetryRule for RandomBackoff {
    fn initialize(&mut self) {
        self.attempts = 0;
    }

    async fn sleep_and_decide(&mut self) -> bool {
        if self.attempts >= self.max_count {
            return false;
        }
        self.attempts += 1;
        let factor = rand::thread_rng().gen_range(0..self.spread);
        tokio::time::sleep(self.unit * factor).await;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_retry_never_retries() {
        let mut rule = NoRetry;
        rule.initialize();
        assert!(!rule.sleep_and_decide().await);
    }

    #[tokio::test]
    async fn fixed_interval_retries_up_to_max_count() {
        let mut rule = FixedInterval::new(Duration::from_millis(1), 2);
        rule.initialize();
        assert!(rule.sleep_and_decide().await);
        assert!(rule.sleep_and_decide().await);
        assert!(!rule.sleep_and_decide().await);
    }

    #[tokio::test]
    async fn exponential_backoff_stops_after_budget() {
        let mut rule =
            ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2), Duration::from_millis(5));
        rule.initialize();
        let mut retried = 0;
        while rule.sleep_and_decide().await {
            retried += 1;
            if retried > 100 {
                panic!("exponential backoff did not converge");
            }
        }
        assert!(retried >= 1);
    }

    #[tokio::test]
    async fn random_backoff_respects_max_count() {
        let mut rule = RandomBackoff::new(Duration::from_millis(1), 3, 3);
        rule.initialize();
        let mut count = 0;
        while rule.sleep_and_decide().await {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn initialize_resets_attempt_counters() {
        let mut rule = FixedInterval::new(Duration::from_millis(1), 1);
        rule.initialize();
        assert!(rule.sleep_and_decide().await);
        assert!(!rule.sleep_and_decide().await);
        rule.initialize();
        assert!(rule.sleep_and_decide().await);
    }
}
