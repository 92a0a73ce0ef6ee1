//! Circuit breaker for the emission path.
//!
//! The breaker counts consecutive publish failures. Once the threshold is
//! reached it opens and rejects publishes until the cooldown expires, then
//! lets exactly one trial through:
//!
//! ```text
//! CLOSED --threshold failures--> OPEN --cooldown--> HALF_OPEN --success--> CLOSED
//!                                  ^                    |
//!                                  +------failure-------+
//! ```
//!
//! An open breaker also resets itself after a long idle period without any
//! publish attempts. All methods take the current instant so the state
//! machine can be driven deterministically.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker rejects publishes.
    pub cooldown: Duration,
    /// Idle time after which an open breaker closes on its own.
    pub idle_reset: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            idle_reset: Duration::from_secs(300),
        }
    }
}

/// Point-in-time view of the breaker for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

/// Consecutive-failure circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
    last_attempt: Option<Instant>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            last_failure: None,
            last_success: None,
            last_attempt: None,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Replace the tuning, keeping the current state.
    pub fn reconfigure(&mut self, config: CircuitConfig) {
        self.config = config;
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
        }
    }

    /// Ask whether a publish may be attempted at `now`.
    ///
    /// Returning `true` from an open breaker moves it to half-open; the
    /// caller must then report the outcome with [`record_success`] or
    /// [`record_failure`]. While the trial is pending every other caller is
    /// rejected.
    ///
    /// [`record_success`]: CircuitBreaker::record_success
    /// [`record_failure`]: CircuitBreaker::record_failure
    pub fn allow(&mut self, now: Instant) -> bool {
        if self.state != CircuitState::Closed && self.idle_expired(now) {
            self.reset();
        }
        self.last_attempt = Some(now);

        match self.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => false,
            CircuitState::Open => {
                let opened_at = self.opened_at.unwrap_or(now);
                if now.saturating_duration_since(opened_at) >= self.config.cooldown {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Report a successful publish.
    pub fn record_success(&mut self, now: Instant) {
        self.last_success = Some(now);
        self.failure_count = 0;
        self.state = CircuitState::Closed;
        self.opened_at = None;
    }

    /// Report a failed publish.
    pub fn record_failure(&mut self, now: Instant) {
        self.last_failure = Some(now);
        self.failure_count = self.failure_count.saturating_add(1);

        match self.state {
            CircuitState::HalfOpen => self.trip(now),
            CircuitState::Closed if self.failure_count >= self.config.failure_threshold => {
                self.trip(now)
            }
            _ => {}
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
    }

    fn reset(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.opened_at = None;
    }

    fn idle_expired(&self, now: Instant) -> bool {
        self.last_attempt
            .map_or(false, |at| now.saturating_duration_since(at) >= self.config.idle_reset)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitConfig {
            failure_threshold: 3,
            cooldown: Duration::from_secs(10),
            idle_reset: Duration::from_secs(600),
        })
    }

    fn fail_times(breaker: &mut CircuitBreaker, now: Instant, n: u32) {
        for _ in 0..n {
            assert!(breaker.allow(now));
            breaker.record_failure(now);
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let mut breaker = breaker();
        let t0 = Instant::now();

        fail_times(&mut breaker, t0, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);

        fail_times(&mut breaker, t0, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failure_count(), 3);
        assert!(!breaker.allow(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_success_resets_count() {
        let mut breaker = breaker();
        let t0 = Instant::now();

        fail_times(&mut breaker, t0, 2);
        assert!(breaker.allow(t0));
        breaker.record_success(t0);
        assert_eq!(breaker.failure_count(), 0);

        fail_times(&mut breaker, t0, 2);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn test_single_half_open_trial_then_close() {
        let mut breaker = breaker();
        let t0 = Instant::now();
        fail_times(&mut breaker, t0, 3);

        let after = t0 + Duration::from_secs(10);
        assert!(breaker.allow(after));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        // Only one trial at a time.
        assert!(!breaker.allow(after));

        breaker.record_success(after);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
        assert!(breaker.allow(after));
    }

    #[test]
    fn test_failed_trial_reopens() {
        let mut breaker = breaker();
        let t0 = Instant::now();
        fail_times(&mut breaker, t0, 3);

        let trial = t0 + Duration::from_secs(11);
        assert!(breaker.allow(trial));
        breaker.record_failure(trial);
        assert_eq!(breaker.state(), CircuitState::Open);

        // Cooldown restarts from the failed trial.
        assert!(!breaker.allow(trial + Duration::from_secs(5)));
        assert!(breaker.allow(trial + Duration::from_secs(10)));
    }

    #[test]
    fn test_idle_reset() {
        let mut breaker = breaker();
        let t0 = Instant::now();
        fail_times(&mut breaker, t0, 3);
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.allow(t0 + Duration::from_secs(601)));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failure_count(), 0);
    }
}
