//! Circuit breaker for one remote provider.
//!
//! All mutation goes through [`CircuitBreaker::apply`] so the admission check
//! and the result bookkeeping can never interleave.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Upper bound on any single open period.
const MAX_COOLDOWN: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    pub base_cooldown_ms: u64,
    /// Cap on the cooldown doubling exponent.
    pub max_backoff_exponent: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            base_cooldown_ms: 10_000,
            max_backoff_exponent: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open { until: Instant },
    /// Cooldown elapsed and one trial call is in flight.
    HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitEvent {
    /// A request asks to reach the provider.
    Admit,
    /// An admitted trial call was stopped by a later gate before calling out.
    TrialAbandoned,
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Allowed as the single half-open trial call.
    Trial,
    Rejected { retry_after: Duration },
    Recorded,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    state: CircuitState,
    consecutive_errors: u32,
    /// Failed trial calls since the circuit last closed.
    reopen_count: u32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            consecutive_errors: 0,
            reopen_count: 0,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Cooldown for the given number of failed trial calls.
    pub fn cooldown(&self, excess: u32) -> Duration {
        let exp = excess.min(self.config.max_backoff_exponent);
        let factor = 1u64.checked_shl(exp).unwrap_or(u64::MAX);
        Duration::from_millis(self.config.base_cooldown_ms.saturating_mul(factor)).min(MAX_COOLDOWN)
    }

    pub fn apply(&mut self, event: CircuitEvent, now: Instant) -> Decision {
        match event {
            CircuitEvent::Admit => self.admit(now),
            CircuitEvent::TrialAbandoned => {
                if self.state == CircuitState::HalfOpen {
                    self.state = CircuitState::Open { until: now };
                }
                Decision::Recorded
            }
            CircuitEvent::Success => {
                if self.state != CircuitState::Closed {
                    tracing::info!(provider = %self.name, "circuit closed");
                }
                self.state = CircuitState::Closed;
                self.consecutive_errors = 0;
                self.reopen_count = 0;
                Decision::Recorded
            }
            CircuitEvent::Failure => {
                self.consecutive_errors += 1;
                match self.state {
                    CircuitState::HalfOpen => {
                        self.reopen_count += 1;
                        self.trip(now);
                    }
                    CircuitState::Closed if self.consecutive_errors >= self.config.failure_threshold => {
                        self.trip(now);
                    }
                    _ => {}
                }
                Decision::Recorded
            }
        }
    }

    fn admit(&mut self, now: Instant) -> Decision {
        match self.state {
            CircuitState::Closed => Decision::Allowed,
            CircuitState::Open { until } if now >= until => {
                self.state = CircuitState::HalfOpen;
                self.consecutive_errors = 0;
                tracing::info!(provider = %self.name, "circuit half-open, admitting one trial call");
                Decision::Trial
            }
            CircuitState::Open { until } => Decision::Rejected {
                retry_after: until - now,
            },
            CircuitState::HalfOpen => Decision::Rejected {
                retry_after: Duration::ZERO,
            },
        }
    }

    fn trip(&mut self, now: Instant) {
        let cooldown = self.cooldown(self.reopen_count);
        self.state = CircuitState::Open { until: now + cooldown };
        tracing::warn!(
            provider = %self.name,
            errors = self.consecutive_errors,
            cooldown_ms = cooldown.as_millis() as u64,
            "circuit opened"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", BreakerConfig::default())
    }

    #[test]
    fn test_trips_after_threshold() {
        let mut b = breaker();
        let t0 = Instant::now();
        for _ in 0..2 {
            assert_eq!(b.apply(CircuitEvent::Admit, t0), Decision::Allowed);
            b.apply(CircuitEvent::Failure, t0);
        }
        assert_eq!(b.state(), CircuitState::Closed);
        b.apply(CircuitEvent::Failure, t0);
        assert_eq!(b.state(), CircuitState::Open { until: t0 + Duration::from_secs(10) });

        let during = t0 + Duration::from_secs(4);
        assert_eq!(
            b.apply(CircuitEvent::Admit, during),
            Decision::Rejected { retry_after: Duration::from_secs(6) }
        );
    }

    #[test]
    fn test_success_resets_counter() {
        let mut b = breaker();
        let t0 = Instant::now();
        b.apply(CircuitEvent::Failure, t0);
        b.apply(CircuitEvent::Failure, t0);
        b.apply(CircuitEvent::Success, t0);
        assert_eq!(b.consecutive_errors(), 0);
        b.apply(CircuitEvent::Failure, t0);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[test]
    fn test_single_trial_after_cooldown() {
        let mut b = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            b.apply(CircuitEvent::Failure, t0);
        }
        let later = t0 + Duration::from_secs(10);
        assert_eq!(b.apply(CircuitEvent::Admit, later), Decision::Trial);
        assert_eq!(b.consecutive_errors(), 0);
        assert_eq!(
            b.apply(CircuitEvent::Admit, later),
            Decision::Rejected { retry_after: Duration::ZERO }
        );

        b.apply(CircuitEvent::Success, later);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.apply(CircuitEvent::Admit, later), Decision::Allowed);
    }

    #[test]
    fn test_failed_trials_back_off_with_cap() {
        let mut b = breaker();
        let mut now = Instant::now();
        for _ in 0..3 {
            b.apply(CircuitEvent::Failure, now);
        }
        let mut expected = Vec::new();
        for _ in 0..5 {
            let CircuitState::Open { until } = b.state() else {
                panic!("expected open circuit");
            };
            expected.push(until - now);
            now = until;
            assert_eq!(b.apply(CircuitEvent::Admit, now), Decision::Trial);
            b.apply(CircuitEvent::Failure, now);
        }
        let secs: Vec<u64> = expected.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![10, 20, 40, 80, 80]);
    }

    #[test]
    fn test_abandoned_trial_reopens_immediately() {
        let mut b = breaker();
        let t0 = Instant::now();
        for _ in 0..3 {
            b.apply(CircuitEvent::Failure, t0);
        }
        let later = t0 + Duration::from_secs(11);
        assert_eq!(b.apply(CircuitEvent::Admit, later), Decision::Trial);
        b.apply(CircuitEvent::TrialAbandoned, later);
        assert_eq!(b.apply(CircuitEvent::Admit, later), Decision::Trial);
    }

    #[test]
    fn test_large_backoff_exponent_saturates() {
        let b = CircuitBreaker::new(
            "test",
            BreakerConfig {
                failure_threshold: 3,
                base_cooldown_ms: 10_000,
                max_backoff_exponent: 200,
            },
        );
        assert_eq!(b.cooldown(0), Duration::from_millis(10_000));
        assert_eq!(b.cooldown(4), Duration::from_millis(160_000));
        assert_eq!(b.cooldown(40), MAX_COOLDOWN);
        assert_eq!(b.cooldown(64), MAX_COOLDOWN);
        assert_eq!(b.cooldown(150), MAX_COOLDOWN);
    }
}
