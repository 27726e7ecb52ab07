//! Circuit breaker guarding telemetry pushes to the control plane.
//!
//! The breaker is CLOSED while the control plane answers, OPEN after `failure_threshold`
//! consecutive failures, and HALF_OPEN once `timeout` has elapsed since the last failure. While
//! HALF_OPEN exactly one trial call is admitted at a time; `success_threshold` consecutive trial
//! successes close it again and any trial failure reopens it.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            timeout: DEFAULT_OPEN_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Point-in-time view served by the monitoring API.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_secs: u64,
    pub last_failure: Option<DateTime<Utc>>,
}

/// How a call was let through; returned by [`CircuitBreaker::can_proceed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Ordinary call while CLOSED.
    Closed,
    /// The single HALF_OPEN trial.
    Trial,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl Inner {
    fn note_failure(&mut self) {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(Instant::now());
        self.last_failure_wall = Some(Utc::now());
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_failure_wall: None,
                trial_in_flight: false,
            }),
        }
    }

    /// Admit a call, or refuse it while the breaker is open or a trial is already running.
    ///
    /// The returned [`Admission`] must be handed back with the call's outcome so that only the
    /// admitted trial can move a HALF_OPEN breaker.
    pub fn can_proceed(&self) -> Option<Admission> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Some(Admission::Closed),
            CircuitState::Open => {
                let cooled = inner
                    .last_failure
                    .is_none_or(|at| at.elapsed() >= self.settings.timeout);
                if !cooled {
                    return None;
                }
                info!("circuit breaker half-open; admitting trial push");
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                inner.trial_in_flight = true;
                Some(Admission::Trial)
            }
            CircuitState::HalfOpen if inner.trial_in_flight => None,
            CircuitState::HalfOpen => {
                inner.trial_in_flight = true;
                Some(Admission::Trial)
            }
        }
    }

    pub fn record_success(&self, admission: Admission) {
        let mut inner = self.lock();
        match (inner.state, admission) {
            (CircuitState::Closed, Admission::Closed) => inner.failure_count = 0,
            (CircuitState::HalfOpen, Admission::Trial) => {
                inner.trial_in_flight = false;
                inner.success_count += 1;
                if inner.success_count >= self.settings.success_threshold {
                    info!("circuit breaker closed");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                }
            }
            // Late answer to a call admitted before the last transition.
            _ => {}
        }
    }

    pub fn record_failure(&self, admission: Admission) {
        let mut inner = self.lock();
        match (inner.state, admission) {
            (CircuitState::Closed, Admission::Closed) => {
                inner.note_failure();
                if inner.failure_count >= self.settings.failure_threshold {
                    warn!(
                        failures = inner.failure_count,
                        timeout_secs = self.settings.timeout.as_secs(),
                        "circuit breaker opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                warn!("trial push failed; circuit breaker reopened");
                inner.note_failure();
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                inner.trial_in_flight = false;
            }
            (CircuitState::Open, Admission::Closed) => inner.note_failure(),
            // A pre-trip call failing while HALF_OPEN says nothing about the trial.
            _ => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: self.settings.failure_threshold,
            success_threshold: self.settings.success_threshold,
            timeout_secs: self.settings.timeout.as_secs(),
            last_failure: inner.last_failure_wall,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Every critical section leaves Inner consistent, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
