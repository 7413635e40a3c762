//! CircuitBreakerAdapter.
//!
//! Protects `PersistenceCore`'s levels 1-2. Only `SystemFailure`-class
//! outcomes count toward opening the breaker — the breaker never forwards
//! data-level errors, so a data error must never trip it. No third-party
//! circuit-breaker crate fits this workspace's dependency stack, so this is
//! a small hand-rolled state machine: plain state, no macros, no background
//! tasks.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Raised by [`CircuitBreaker::call`] when the breaker is `Open` (or
/// `HalfOpen` with no trial slot available). The caller (the ingestion
/// buffer's flush loop) interprets this as: pause the stream, sleep a
/// backoff, retry the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallNotPermitted;

impl std::fmt::Display for CallNotPermitted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "circuit breaker open: call not permitted")
    }
}

impl std::error::Error for CallNotPermitted {}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Fraction of failures in the rolling window, in (0.0, 1.0], above
    /// which the breaker opens.
    pub failure_rate_threshold: f64,
    /// Minimum number of calls recorded before the failure rate is evaluated.
    pub minimum_calls: usize,
    /// Size of the rolling window (number of recent call outcomes kept).
    pub window_size: usize,
    /// How long the breaker stays `Open` before moving to `HalfOpen`.
    pub open_duration: Duration,
    /// How many trial calls are permitted while `HalfOpen`.
    pub half_open_trial_calls: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            minimum_calls: 5,
            window_size: 20,
            open_duration: Duration::from_secs(10),
            half_open_trial_calls: 3,
        }
    }
}

struct Inner {
    state: BreakerState,
    outcomes: VecDeque<bool>, // true = success
    opened_at: Option<Instant>,
    half_open_trials_used: usize,
    half_open_trials_succeeded: usize,
}

/// Thread-safe circuit breaker. `execute`/`call` wraps a fallible operation;
/// only the caller-designated "system failure" outcomes count toward
/// opening (see [`CircuitBreaker::record_outcome`]).
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                outcomes: VecDeque::with_capacity(config.window_size),
                opened_at: None,
                half_open_trials_used: 0,
                half_open_trials_succeeded: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.transition_if_due(&mut inner);
        inner.state
    }

    /// Check whether a call is currently permitted, transitioning
    /// Open -> HalfOpen if the open duration has elapsed. Call this before
    /// attempting the protected operation.
    pub fn try_acquire(&self) -> Result<(), CallNotPermitted> {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.transition_if_due(&mut inner);

        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => Err(CallNotPermitted),
            BreakerState::HalfOpen => {
                if inner.half_open_trials_used < self.config.half_open_trial_calls {
                    inner.half_open_trials_used += 1;
                    Ok(())
                } else {
                    Err(CallNotPermitted)
                }
            }
        }
    }

    /// Record the outcome of a protected call. `is_system_failure` must be
    /// `true` only for the SystemFailure class; data errors must never be
    /// reported here (the caller simply doesn't call `record_outcome` for
    /// data errors at all).
    pub fn record_outcome(&self, is_system_failure: bool) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        self.transition_if_due(&mut inner);

        match inner.state {
            BreakerState::HalfOpen => {
                if is_system_failure {
                    self.open(&mut inner);
                } else {
                    inner.half_open_trials_succeeded += 1;
                    if inner.half_open_trials_succeeded >= self.config.half_open_trial_calls {
                        self.close(&mut inner);
                    }
                }
            }
            BreakerState::Closed => {
                inner.outcomes.push_back(!is_system_failure);
                if inner.outcomes.len() > self.config.window_size {
                    inner.outcomes.pop_front();
                }
                if inner.outcomes.len() >= self.config.minimum_calls {
                    let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
                    let rate = failures as f64 / inner.outcomes.len() as f64;
                    if rate >= self.config.failure_rate_threshold {
                        self.open(&mut inner);
                    }
                }
            }
            BreakerState::Open => {
                // A call should not have been permitted in this state; ignore.
            }
        }
    }

    fn transition_if_due(&self, inner: &mut Inner) {
        if inner.state == BreakerState::Open {
            if let Some(opened_at) = inner.opened_at {
                if opened_at.elapsed() >= self.config.open_duration {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_trials_used = 0;
                    inner.half_open_trials_succeeded = 0;
                }
            }
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.outcomes.clear();
    }

    fn close(&self, inner: &mut Inner) {
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
        inner.outcomes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BreakerConfig {
        BreakerConfig {
            failure_rate_threshold: 0.5,
            minimum_calls: 4,
            window_size: 10,
            open_duration: Duration::from_millis(20),
            half_open_trial_calls: 2,
        }
    }

    #[test]
    fn stays_closed_under_threshold() {
        let cb = CircuitBreaker::new(test_config());
        cb.try_acquire().unwrap();
        cb.record_outcome(false); // success
        cb.try_acquire().unwrap();
        cb.record_outcome(true); // one system failure
        cb.try_acquire().unwrap();
        cb.record_outcome(false);
        cb.try_acquire().unwrap();
        cb.record_outcome(false);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn opens_after_failure_rate_exceeded() {
        let cb = CircuitBreaker::new(test_config());
        for _ in 0..4 {
            cb.try_acquire().unwrap();
            cb.record_outcome(true); // is_system_failure=true
        }
        assert_eq!(cb.state(), BreakerState::Open);
        assert_eq!(cb.try_acquire(), Err(CallNotPermitted));
    }

    #[test]
    fn half_opens_after_duration_then_closes_on_success() {
        let cb = CircuitBreaker::new(test_config());
        for _ in 0..4 {
            cb.try_acquire().unwrap();
            cb.record_outcome(true);
        }
        assert_eq!(cb.state(), BreakerState::Open);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.try_acquire().unwrap();
        cb.record_outcome(false);
        cb.try_acquire().unwrap();
        cb.record_outcome(false);
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new(test_config());
        for _ in 0..4 {
            cb.try_acquire().unwrap();
            cb.record_outcome(true);
        }
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(cb.state(), BreakerState::HalfOpen);

        cb.try_acquire().unwrap();
        cb.record_outcome(true); // system failure during trial
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
