use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit::CircuitBreakerPolicy;
use crate::credential::{DEFAULT_REFRESH_TIMEOUT, DEFAULT_SAFETY_MARGIN};
use crate::retry::RetryPolicy;

/// Tuning presets for common traffic shapes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientProfile {
    #[default]
    StandardSdk,
    LowLatency,
    HighThroughput,
}

impl ClientProfile {
    pub fn defaults(self) -> ResilienceConfig {
        match self {
            Self::StandardSdk => ResilienceConfig::default(),
            Self::LowLatency => ResilienceConfig {
                failure_threshold: 3,
                recovery_timeout_ms: 10_000,
                max_retries: 1,
                base_delay_ms: 50,
                max_delay_ms: 300,
                jitter_window_ms: 25,
                timeout_per_attempt_ms: 2_000,
                ..ResilienceConfig::default()
            },
            Self::HighThroughput => ResilienceConfig {
                failure_threshold: 10,
                recovery_timeout_ms: 30_000,
                max_retries: 3,
                base_delay_ms: 150,
                max_delay_ms: 3_000,
                jitter_window_ms: 150,
                timeout_per_attempt_ms: 20_000,
                ..ResilienceConfig::default()
            },
        }
    }
}

/// Externally loadable resilience settings. Durations are milliseconds; missing
/// fields take the standard defaults.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub failure_threshold: usize,
    pub recovery_timeout_ms: u64,
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_window_ms: u64,
    pub timeout_per_attempt_ms: u64,
    pub respect_retry_after: bool,
    pub credential_safety_margin_ms: u64,
    pub credential_refresh_timeout_ms: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        let breaker = CircuitBreakerPolicy::standard();
        let retry = RetryPolicy::standard();
        Self {
            failure_threshold: breaker.configured_failure_threshold(),
            recovery_timeout_ms: duration_ms(breaker.configured_recovery_timeout()),
            max_retries: retry.configured_max_retries(),
            base_delay_ms: duration_ms(retry.configured_base_delay()),
            max_delay_ms: duration_ms(retry.configured_max_delay()),
            jitter_window_ms: duration_ms(retry.configured_jitter_window()),
            timeout_per_attempt_ms: duration_ms(retry.configured_timeout_per_attempt()),
            respect_retry_after: true,
            credential_safety_margin_ms: duration_ms(DEFAULT_SAFETY_MARGIN),
            credential_refresh_timeout_ms: duration_ms(DEFAULT_REFRESH_TIMEOUT),
        }
    }
}

impl ResilienceConfig {
    pub fn circuit_breaker_policy(&self) -> CircuitBreakerPolicy {
        CircuitBreakerPolicy::standard()
            .failure_threshold(self.failure_threshold)
            .recovery_timeout(Duration::from_millis(self.recovery_timeout_ms))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::standard()
            .max_retries(self.max_retries)
            .base_delay(Duration::from_millis(self.base_delay_ms))
            .max_delay(Duration::from_millis(self.max_delay_ms))
            .jitter_window(Duration::from_millis(self.jitter_window_ms))
            .timeout_per_attempt(Duration::from_millis(self.timeout_per_attempt_ms))
            .respect_retry_after(self.respect_retry_after)
    }

    pub fn credential_safety_margin(&self) -> Duration {
        Duration::from_millis(self.credential_safety_margin_ms)
    }

    pub fn credential_refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.credential_refresh_timeout_ms).max(Duration::from_millis(1))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
