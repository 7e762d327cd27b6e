use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Consecutive failures that trip the breaker open.
const FAILURE_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    last_failure: Option<Instant>,
}

/// Three-state circuit breaker guarding upstream chat calls.
///
/// Closed executes normally; `FAILURE_THRESHOLD` consecutive failures open
/// the circuit. While Open, calls are rejected until the recovery timeout
/// elapses, after which exactly one probe is admitted (HalfOpen). The probe
/// either closes the circuit again or re-opens it.
///
/// Status 5xx and transport errors count as failures; 429 and 408 are
/// retried by the caller but do not affect breaker health.
pub struct CircuitBreaker {
    recovery: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(recovery: Duration) -> Self {
        Self {
            recovery,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Whether a call may proceed. The transition Open -> HalfOpen happens
    /// here: the first caller after the recovery window becomes the probe,
    /// and further callers are rejected until the probe reports back.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let recovered = inner
                    .last_failure
                    .is_some_and(|t| t.elapsed() > self.recovery);
                if recovered {
                    inner.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => false,
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.failures = 0;
        inner.state = BreakerState::Closed;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        if inner.state == BreakerState::HalfOpen || inner.failures >= FAILURE_THRESHOLD {
            inner.state = BreakerState::Open;
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }
}
