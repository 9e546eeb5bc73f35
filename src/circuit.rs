use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::util::lock_unpoisoned;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitBreakerPolicy {
    failure_threshold: usize,
    recovery_timeout: Duration,
}

impl CircuitBreakerPolicy {
    pub const fn standard() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
        }
    }

    pub const fn failure_threshold(mut self, failure_threshold: usize) -> Self {
        self.failure_threshold = if failure_threshold == 0 {
            1
        } else {
            failure_threshold
        };
        self
    }

    pub const fn recovery_timeout(mut self, recovery_timeout: Duration) -> Self {
        self.recovery_timeout = recovery_timeout;
        self
    }

    pub const fn configured_failure_threshold(self) -> usize {
        self.failure_threshold
    }

    pub const fn configured_recovery_timeout(self) -> Duration {
        self.recovery_timeout
    }
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitPhase {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        formatter.write_str(text)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitStatus {
    pub phase: CircuitPhase,
    pub is_open: bool,
    pub failure_count: usize,
    pub last_failure_at: Option<Instant>,
    pub time_since_last_failure: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Admission {
    Closed,
    Probe,
}

#[derive(Debug)]
enum Phase {
    Closed,
    Open,
    HalfOpen { probe_in_flight: bool },
}

#[derive(Debug)]
struct CircuitState {
    phase: Phase,
    failure_count: usize,
    last_failure_at: Option<Instant>,
}

impl CircuitState {
    fn closed() -> Self {
        Self {
            phase: Phase::Closed,
            failure_count: 0,
            last_failure_at: None,
        }
    }
}

/// Tracks backend health for one target and decides whether a call may be attempted.
///
/// ```text
/// Closed   -> Open      failure_count reaches the threshold
/// Open     -> HalfOpen  recovery timeout elapsed since the last failure
/// HalfOpen -> Closed    the single probe succeeds
/// HalfOpen -> Open      the single probe fails
/// ```
pub struct CircuitBreaker {
    policy: CircuitBreakerPolicy,
    clock: Arc<dyn Clock>,
    state: Mutex<CircuitState>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CircuitBreaker")
            .field("policy", &self.policy)
            .field("state", &*lock_unpoisoned(&self.state))
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(policy: CircuitBreakerPolicy) -> Self {
        Self::with_clock(policy, Arc::new(SystemClock))
    }

    pub fn with_clock(policy: CircuitBreakerPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            clock,
            state: Mutex::new(CircuitState::closed()),
        }
    }

    pub fn policy(&self) -> CircuitBreakerPolicy {
        self.policy
    }

    /// Returns whether a call may be attempted now.
    ///
    /// Once the recovery window has elapsed this moves the breaker to half-open and
    /// hands out the single probe slot; the caller must settle it with
    /// [`record_success`](Self::record_success) or [`record_failure`](Self::record_failure).
    pub fn allow_request(&self) -> bool {
        self.admit().is_ok()
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut state = lock_unpoisoned(&self.state);
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_at = Some(now);
        match state.phase {
            Phase::Closed => {
                if state.failure_count >= self.policy.failure_threshold.max(1) {
                    state.phase = Phase::Open;
                    warn!(
                        failure_count = state.failure_count,
                        recovery_timeout_ms = self.policy.recovery_timeout.as_millis() as u64,
                        "circuit breaker opened"
                    );
                }
            }
            Phase::HalfOpen { .. } => {
                state.phase = Phase::Open;
                warn!(
                    failure_count = state.failure_count,
                    "circuit breaker probe failed; re-opened"
                );
            }
            Phase::Open => {}
        }
    }

    pub fn record_success(&self) {
        let mut state = lock_unpoisoned(&self.state);
        if !matches!(state.phase, Phase::Closed) {
            info!(
                failure_count = state.failure_count,
                "circuit breaker closed"
            );
        }
        state.phase = Phase::Closed;
        state.failure_count = 0;
    }

    pub fn reset(&self) {
        let mut state = lock_unpoisoned(&self.state);
        *state = CircuitState::closed();
        info!("circuit breaker reset");
    }

    pub fn status(&self) -> CircuitStatus {
        let now = self.clock.now();
        let state = lock_unpoisoned(&self.state);
        let time_since_last_failure = state
            .last_failure_at
            .map(|at| now.saturating_duration_since(at));
        let phase = match state.phase {
            Phase::Closed => CircuitPhase::Closed,
            Phase::HalfOpen { .. } => CircuitPhase::HalfOpen,
            Phase::Open => {
                let elapsed = time_since_last_failure.unwrap_or(Duration::MAX);
                if elapsed >= self.policy.recovery_timeout {
                    CircuitPhase::HalfOpen
                } else {
                    CircuitPhase::Open
                }
            }
        };
        CircuitStatus {
            phase,
            is_open: phase == CircuitPhase::Open,
            failure_count: state.failure_count,
            last_failure_at: state.last_failure_at,
            time_since_last_failure,
        }
    }

    fn admit(&self) -> Result<Admission, Duration> {
        let now = self.clock.now();
        let mut state = lock_unpoisoned(&self.state);
        match state.phase {
            Phase::Closed => Ok(Admission::Closed),
            Phase::Open => {
                let elapsed = state
                    .last_failure_at
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.policy.recovery_timeout {
                    state.phase = Phase::HalfOpen {
                        probe_in_flight: true,
                    };
                    info!(
                        failure_count = state.failure_count,
                        "circuit breaker half-open; admitting probe"
                    );
                    return Ok(Admission::Probe);
                }
                Err(self.policy.recovery_timeout - elapsed)
            }
            Phase::HalfOpen { probe_in_flight } => {
                if probe_in_flight {
                    return Err(Duration::ZERO);
                }
                state.phase = Phase::HalfOpen {
                    probe_in_flight: true,
                };
                Ok(Admission::Probe)
            }
        }
    }

    fn release_probe(&self) {
        let mut state = lock_unpoisoned(&self.state);
        if let Phase::HalfOpen { probe_in_flight } = &mut state.phase {
            *probe_in_flight = false;
        }
    }
}

/// Admission for one logical call.
///
/// Settled at most once. Dropping an unsettled permit leaves the breaker's health
/// untouched and frees the half-open probe slot it may hold.
pub(crate) struct CircuitPermit {
    breaker: Arc<CircuitBreaker>,
    admission: Admission,
    settled: bool,
}

impl CircuitPermit {
    pub(crate) fn acquire(breaker: &Arc<CircuitBreaker>) -> Result<Self, Duration> {
        let admission = breaker.admit()?;
        Ok(Self {
            breaker: Arc::clone(breaker),
            admission,
            settled: false,
        })
    }

    pub(crate) fn is_probe(&self) -> bool {
        self.admission == Admission::Probe
    }

    pub(crate) fn succeed(mut self) {
        self.breaker.record_success();
        self.settled = true;
    }

    pub(crate) fn fail(mut self) {
        self.breaker.record_failure();
        self.settled = true;
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Probe {
            self.breaker.release_probe();
        }
    }
}
