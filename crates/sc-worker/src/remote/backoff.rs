//! Exponential backoff between reconnect attempts

use std::time::Duration;

use sc_core::config::BackoffConfig;
use tokio::time::Instant;

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first retry
    initial: Duration,
    /// Current delay
    current: Duration,
    /// Maximum delay
    max: Duration,
    /// Multiplier
    multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a new backoff from configuration
    pub fn from_config(config: &BackoffConfig) -> Self {
        Self::new(config.initial, config.max, config.multiplier, config.jitter)
    }

    /// Create a new backoff with custom parameters
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            current: initial,
            max,
            multiplier,
            jitter,
        }
    }

    /// Get the next delay and advance the backoff
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;

        let next = Duration::from_secs_f64(self.current.as_secs_f64() * self.multiplier);
        self.current = std::cmp::min(next, self.max);

        let jitter_amount = delay.as_secs_f64() * self.jitter * rand::random::<f64>();
        delay + Duration::from_secs_f64(jitter_amount)
    }

    /// Reset the backoff to its initial delay
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Reconnect gate for one node.
///
/// Each failure pushes the next permitted attempt further out; success
/// clears it.
#[derive(Debug, Clone)]
pub struct RetryGate {
    backoff: ExponentialBackoff,
    not_before: Option<Instant>,
}

impl RetryGate {
    /// Create an open gate
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            backoff,
            not_before: None,
        }
    }

    /// Whether an attempt is allowed now
    pub fn is_open(&self) -> bool {
        self.not_before.map_or(true, |at| Instant::now() >= at)
    }

    /// Time left until the gate opens
    pub fn remaining(&self) -> Duration {
        self.not_before
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }

    /// Record a failed attempt, returning the delay imposed
    pub fn failed(&mut self) -> Duration {
        let delay = self.backoff.next_delay();
        self.not_before = Some(Instant::now() + delay);
        delay
    }

    /// Record a successful attempt
    pub fn succeeded(&mut self) {
        self.backoff.reset();
        self.not_before = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_increases() {
        let mut backoff = ExponentialBackoff::new(
            Duration::from_secs(1),
            Duration::from_secs(60),
            2.0,
            0.0,
        );

        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    #[test]
    fn test_backoff_max() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(30), Duration::from_secs(60), 2.0, 0.0);

        assert_eq!(backoff.next_delay(), Duration::from_secs(30));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0, 0.0);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff =
            ExponentialBackoff::new(Duration::from_secs(10), Duration::from_secs(60), 1.0, 0.5);
        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(10));
            assert!(delay <= Duration::from_secs(15));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gate_opens_after_delay() {
        let mut gate = RetryGate::new(ExponentialBackoff::new(
            Duration::from_secs(5),
            Duration::from_secs(60),
            2.0,
            0.0,
        ));
        assert!(gate.is_open());

        assert_eq!(gate.failed(), Duration::from_secs(5));
        assert!(!gate.is_open());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(gate.is_open());

        assert_eq!(gate.failed(), Duration::from_secs(10));
        gate.succeeded();
        assert!(gate.is_open());
        assert_eq!(gate.remaining(), Duration::ZERO);
    }
}
