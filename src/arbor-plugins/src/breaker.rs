//! Circuit breaker scoped per (plugin, hook type).
//!
//! One misbehaving plugin never blocks siblings on the same hook type: each
//! pair gets its own failure counter, created lazily on first registration.

use std::time::{Duration, Instant};

use serde::Serialize;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Dispatching normally.
    Closed,
    /// Dispatch skipped until the timeout elapses.
    Open,
    /// One trial invocation allowed.
    HalfOpen,
}

/// Dispatch decision for one callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Invoke the callback.
    Allow,
    /// Skip the callback and synthesize a circuit-open failure.
    Skip,
}

/// Failure counter for one (plugin, hook type) pair.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_count: u32,
    failure_threshold: u32,
    state: BreakerState,
    last_failure: Option<Instant>,
    timeout: Duration,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
            state: BreakerState::Closed,
            last_failure: None,
            timeout,
        }
    }

    /// Current state.
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    /// Decide whether the next invocation may proceed.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open and
    /// admits exactly one trial; further acquisitions skip until the trial
    /// resolves.
    pub fn try_acquire(&mut self) -> BreakerDecision {
        match self.state {
            BreakerState::Closed => BreakerDecision::Allow,
            BreakerState::Open => {
                let elapsed = self
                    .last_failure
                    .map(|t| t.elapsed() >= self.timeout)
                    .unwrap_or(true);
                if elapsed {
                    self.state = BreakerState::HalfOpen;
                    BreakerDecision::Allow
                } else {
                    BreakerDecision::Skip
                }
            }
            // Trial already in flight.
            BreakerState::HalfOpen => BreakerDecision::Skip,
        }
    }

    /// Record a successful invocation: counter resets, breaker closes.
    pub fn record_success(&mut self) {
        self.failure_count = 0;
        self.last_failure = None;
        self.state = BreakerState::Closed;
    }

    /// Record a failed invocation.
    ///
    /// A failed half-open trial re-opens the breaker immediately rather than
    /// counting back up to the threshold; a closed breaker opens exactly upon
    /// reaching `failure_threshold` consecutive failures.
    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        match self.state {
            BreakerState::HalfOpen => self.state = BreakerState::Open,
            BreakerState::Closed if self.failure_count >= self.failure_threshold => {
                self.state = BreakerState::Open;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_exactly_at_threshold() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));

        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);

        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.try_acquire(), BreakerDecision::Skip);
    }

    #[test]
    fn test_single_success_resets() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();

        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_timeout_allows_one_trial() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        // Timeout of zero has always elapsed: one trial goes through.
        assert_eq!(breaker.try_acquire(), BreakerDecision::Allow);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // Second acquisition while the trial is in flight is skipped.
        assert_eq!(breaker.try_acquire(), BreakerDecision::Skip);
    }

    #[test]
    fn test_failed_trial_reopens_immediately() {
        let mut breaker = CircuitBreaker::new(5, Duration::from_millis(0));
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        assert_eq!(breaker.try_acquire(), BreakerDecision::Allow);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_successful_trial_closes() {
        let mut breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();

        assert_eq!(breaker.try_acquire(), BreakerDecision::Allow);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert_eq!(breaker.try_acquire(), BreakerDecision::Allow);
    }
}
