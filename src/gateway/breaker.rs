//! Consecutive-failure circuit breaker guarding outbound gateway calls.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    last_failure_at: Option<Instant>,
}

/// Opens after `threshold` consecutive failures and closes again on the first
/// `allow()` after `cooldown` has elapsed, without waiting for a successful trial call.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                last_failure_at: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a call may go out now.
    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        if inner.state == CircuitState::Closed {
            return true;
        }

        let cooled = inner
            .last_failure_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.cooldown);
        if cooled {
            inner.state = CircuitState::Closed;
            inner.failures = 0;
            info!("Gateway circuit breaker closed after cooldown");
            true
        } else {
            false
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure_at = Some(now);

        if inner.state == CircuitState::Closed && inner.failures >= self.threshold {
            inner.state = CircuitState::Open;
            warn!(
                failures = inner.failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Gateway circuit breaker opened"
            );
        }
    }

    /// Reset the failure count. Leaves the state alone; only `allow()` closes.
    pub fn record_success(&self) {
        self.lock().failures = 0;
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failures(&self) -> u32 {
        self.lock().failures
    }

    /// Time until an open breaker lets calls through again. Zero when closed.
    pub fn cooldown_remaining(&self) -> Duration {
        self.cooldown_remaining_at(Instant::now())
    }

    fn cooldown_remaining_at(&self, now: Instant) -> Duration {
        let inner = self.lock();
        match (inner.state, inner.last_failure_at) {
            (CircuitState::Open, Some(at)) => self
                .cooldown
                .saturating_sub(now.saturating_duration_since(at)),
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        let now = Instant::now();

        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        assert!(breaker.allow_at(now));
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.record_failure_at(now);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failures(), 3);
        assert!(!breaker.allow_at(now + Duration::from_secs(59)));
    }

    #[test]
    fn closes_optimistically_once_cooldown_elapses() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        let now = Instant::now();
        breaker.record_failure_at(now);
        breaker.record_failure_at(now);
        assert_eq!(breaker.state(), CircuitState::Open);

        assert!(breaker.allow_at(now + Duration::from_secs(60)));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.failures(), 0);
    }

    #[test]
    fn success_resets_failures_but_not_state() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failures(), 0);

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failures(), 0);
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn failures_spread_by_success_never_open() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        for _ in 0..5 {
            breaker.record_failure();
            breaker.record_success();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn cooldown_remaining_counts_down_without_closing() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        let now = Instant::now();
        assert_eq!(breaker.cooldown_remaining_at(now), Duration::ZERO);

        breaker.record_failure_at(now);
        assert_eq!(
            breaker.cooldown_remaining_at(now + Duration::from_secs(20)),
            Duration::from_secs(40)
        );
        assert_eq!(
            breaker.cooldown_remaining_at(now + Duration::from_secs(90)),
            Duration::ZERO
        );
        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.failures(), 1);
    }
}
