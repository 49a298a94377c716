//! # Circuit Breaker
//!
//! Per-device failure gate wrapping pool acquisition (spec §4.4). State is
//! a rolling window of recent outcomes behind a `parking_lot::Mutex` —
//! short critical section, no I/O inside, per spec §5's shared-resource
//! policy.

use crate::value::DeviceId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct BreakerInner {
    state: BreakerState,
    window: VecDeque<bool>,
    window_size: usize,
    opened_at: Option<Instant>,
    trials_admitted: u32,
}

impl BreakerInner {
    fn request_count(&self) -> usize {
        self.window.len()
    }

    fn failure_count(&self) -> usize {
        self.window.iter().filter(|ok| !**ok).count()
    }
}

/// Per-device breaker (spec §3 Breaker, §4.4).
pub struct CircuitBreaker {
    device_id: DeviceId,
    min_requests: u32,
    failure_ratio: f64,
    open_timeout: Duration,
    max_trials: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(device_id: DeviceId, min_requests: u32, failure_ratio: f64, open_timeout: Duration, max_trials: u32, window_size: usize) -> Self {
        Self {
            device_id,
            min_requests,
            failure_ratio,
            open_timeout,
            max_trials,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(window_size),
                window_size,
                opened_at: None,
                trials_admitted: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether an acquire attempt should be admitted right now. Transitions
    /// `open` → `half-open` if `open-timeout` has elapsed.
    pub fn allow(&self) -> Result<(), BreakerDecision> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.open_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.trials_admitted = 0;
                    info!(device_id = %self.device_id, "breaker half-open after timeout");
                    inner.trials_admitted += 1;
                    Ok(())
                } else {
                    Err(BreakerDecision::Open)
                }
            }
            BreakerState::HalfOpen => {
                if inner.trials_admitted < self.max_trials {
                    inner.trials_admitted += 1;
                    Ok(())
                } else {
                    Err(BreakerDecision::Open)
                }
            }
        }
    }

    /// Record the outcome of an admitted attempt. Only errors for which
    /// `GatewayError::counts_against_breaker()` is true should be recorded
    /// as a failure (spec §4.4: "address/type errors... MUST NOT count").
    /// Returns `true` exactly when this call is the one that trips the
    /// breaker open, so callers can feed `Diagnostics::record_breaker_trip`.
    pub fn record(&self, success: bool) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                if success {
                    if inner.trials_admitted >= self.max_trials {
                        inner.state = BreakerState::Closed;
                        inner.window.clear();
                        inner.opened_at = None;
                        info!(device_id = %self.device_id, "breaker closed after successful trials");
                    }
                    false
                } else {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(device_id = %self.device_id, "breaker reopened on trial failure");
                    true
                }
            }
            BreakerState::Closed => {
                if inner.window.len() >= inner.window_size {
                    inner.window.pop_front();
                }
                inner.window.push_back(success);
                let requests = inner.request_count() as u32;
                let failures = inner.failure_count() as u32;
                if requests >= self.min_requests && (failures as f64 / requests as f64) >= self.failure_ratio {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    warn!(device_id = %self.device_id, requests, failures, "breaker tripped open");
                    true
                } else {
                    false
                }
            }
            BreakerState::Open => {
                // Outcomes recorded while open (shouldn't normally happen,
                // `allow()` rejects first) are ignored.
                false
            }
        }
    }
}

/// Why an `allow()` call was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Open,
}

/// Process-global registry mapping device id to its breaker (spec §9).
pub struct BreakerRegistry {
    breakers: Mutex<HashMap<DeviceId, Arc<CircuitBreaker>>>,
    min_requests: u32,
    failure_ratio: f64,
    open_timeout: Duration,
    max_trials: u32,
    window_size: usize,
}

impl BreakerRegistry {
    pub fn new(min_requests: u32, failure_ratio: f64, open_timeout: Duration, max_trials: u32, window_size: usize) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            min_requests,
            failure_ratio,
            open_timeout,
            max_trials,
            window_size,
        }
    }

    pub fn breaker_for(&self, device_id: &DeviceId) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(device_id.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    device_id.clone(),
                    self.min_requests,
                    self.failure_ratio,
                    self.open_timeout,
                    self.max_trials,
                    self.window_size,
                ))
            })
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(DeviceId::from("dev-1"), 10, 0.5, Duration::from_millis(50), 3, 64)
    }

    #[test]
    fn trips_open_after_min_requests_and_failure_ratio_exceeded() {
        let b = breaker();
        for _ in 0..10 {
            b.allow().unwrap();
            b.record(false);
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.allow(), Err(BreakerDecision::Open));
    }

    #[test]
    fn open_breaker_rejects_all_acquires_until_timeout() {
        let b = breaker();
        for _ in 0..10 {
            b.allow().unwrap();
            b.record(false);
        }
        assert_eq!(b.allow(), Err(BreakerDecision::Open));
        std::thread::sleep(Duration::from_millis(60));
        assert!(b.allow().is_ok());
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_closes_after_max_trials_succeed() {
        let b = breaker();
        for _ in 0..10 {
            b.allow().unwrap();
            b.record(false);
        }
        std::thread::sleep(Duration::from_millis(60));
        for _ in 0..3 {
            b.allow().unwrap();
            b.record(true);
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_reopens_immediately_on_any_failure() {
        let b = breaker();
        for _ in 0..10 {
            b.allow().unwrap();
            b.record(false);
        }
        std::thread::sleep(Duration::from_millis(60));
        b.allow().unwrap();
        b.record(false);
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn below_min_requests_never_trips() {
        let b = breaker();
        for _ in 0..5 {
            b.allow().unwrap();
            b.record(false);
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }
}
