use std::time::Duration;

use http::StatusCode;
use rand::Rng;

use crate::error::TransportErrorKind;

/// Classified result of one network attempt within a logical call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Timeout,
    NetworkError(TransportErrorKind),
    HttpStatus(StatusCode),
    Aborted,
}

impl AttemptOutcome {
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_success() {
            Self::Success
        } else {
            Self::HttpStatus(status)
        }
    }

    /// Timeouts, transport failures, 5xx and 429: the backend is unhealthy or overloaded.
    pub fn is_infrastructure_failure(&self) -> bool {
        match self {
            Self::Timeout | Self::NetworkError(_) => true,
            Self::HttpStatus(status) => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Success | Self::Aborted => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: usize,
    base_delay: Duration,
    max_delay: Duration,
    jitter_window: Duration,
    timeout_per_attempt: Duration,
    respect_retry_after: bool,
}

impl RetryPolicy {
    pub const fn standard() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter_window: Duration::from_millis(100),
            timeout_per_attempt: Duration::from_secs(10),
            respect_retry_after: true,
        }
    }

    pub const fn disabled() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            jitter_window: Duration::ZERO,
            timeout_per_attempt: Duration::from_secs(10),
            respect_retry_after: true,
        }
    }

    pub const fn max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        if self.max_delay < self.base_delay {
            self.max_delay = self.base_delay;
        }
        self
    }

    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.max(self.base_delay);
        self
    }

    pub const fn jitter_window(mut self, jitter_window: Duration) -> Self {
        self.jitter_window = jitter_window;
        self
    }

    pub fn timeout_per_attempt(mut self, timeout_per_attempt: Duration) -> Self {
        self.timeout_per_attempt = timeout_per_attempt.max(Duration::from_millis(1));
        self
    }

    pub const fn respect_retry_after(mut self, respect_retry_after: bool) -> Self {
        self.respect_retry_after = respect_retry_after;
        self
    }

    pub const fn configured_max_retries(&self) -> usize {
        self.max_retries
    }

    pub const fn configured_timeout_per_attempt(&self) -> Duration {
        self.timeout_per_attempt
    }

    pub const fn configured_base_delay(&self) -> Duration {
        self.base_delay
    }

    pub const fn configured_max_delay(&self) -> Duration {
        self.max_delay
    }

    pub const fn configured_jitter_window(&self) -> Duration {
        self.jitter_window
    }

    /// Total attempts allowed for one logical call.
    pub const fn max_attempts(&self) -> usize {
        self.max_retries.saturating_add(1)
    }

    /// Whether attempt `attempt_index` (zero-based) may be followed by another one.
    pub fn should_retry(&self, attempt_index: usize, outcome: &AttemptOutcome) -> bool {
        attempt_index < self.max_retries && outcome.is_infrastructure_failure()
    }

    /// `base_delay * 2^attempt_index` plus uniform jitter, capped at `max_delay`.
    pub fn delay_for(&self, attempt_index: usize) -> Duration {
        let exponent = attempt_index.min(31) as u32;
        let multiplier = 1_u128 << exponent;
        let base_ms = self.base_delay.as_millis();
        let max_ms = self.max_delay.as_millis();
        let delay_ms = base_ms
            .saturating_mul(multiplier)
            .saturating_add(self.sample_jitter_ms())
            .min(max_ms)
            .min(u64::MAX as u128) as u64;
        Duration::from_millis(delay_ms)
    }

    pub(crate) fn delay_with_retry_after(
        &self,
        attempt_index: usize,
        retry_after: Option<Duration>,
    ) -> Duration {
        let computed = self.delay_for(attempt_index);
        match retry_after {
            Some(retry_after) if self.respect_retry_after => {
                computed.max(retry_after).min(self.max_delay)
            }
            _ => computed,
        }
    }

    fn sample_jitter_ms(&self) -> u128 {
        let window_ms = self.jitter_window.as_millis().min(u64::MAX as u128) as u64;
        if window_ms == 0 {
            return 0;
        }
        let mut rng = rand::rng();
        u128::from(rng.random_range(0..=window_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}
