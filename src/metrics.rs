use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::Error;
use crate::response::Response;
use crate::util::lock_unpoisoned;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub calls_started: u64,
    pub calls_succeeded: u64,
    pub calls_failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub circuit_rejections: u64,
    pub credential_refreshes: u64,
    pub in_flight: u64,
    pub latency_samples: u64,
    pub latency_total_ms: u64,
    pub latency_avg_ms: f64,
    pub error_counts: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, Default)]
pub(crate) struct ExecutorMetrics {
    inner: Arc<ExecutorMetricsInner>,
}

#[derive(Debug, Default)]
struct ExecutorMetricsInner {
    calls_started: AtomicU64,
    calls_succeeded: AtomicU64,
    calls_failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    circuit_rejections: AtomicU64,
    in_flight: AtomicU64,
    latency_total_ms: AtomicU64,
    latency_samples: AtomicU64,
    error_counts: Mutex<BTreeMap<String, u64>>,
}

pub(crate) struct InFlightGuard {
    metrics: ExecutorMetrics,
}

impl ExecutorMetrics {
    pub(crate) fn enter_call(&self) -> InFlightGuard {
        self.inner.calls_started.fetch_add(1, Ordering::Relaxed);
        self.inner.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard {
            metrics: self.clone(),
        }
    }

    pub(crate) fn record_attempt(&self) {
        self.inner.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.inner.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_call_completed(&self, result: &Result<Response, Error>, latency: Duration) {
        self.record_latency(latency);
        match result {
            Ok(_) => {
                self.inner.calls_succeeded.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.inner.calls_failed.fetch_add(1, Ordering::Relaxed);
                if matches!(error, Error::CircuitOpen { .. }) {
                    self.inner.circuit_rejections.fetch_add(1, Ordering::Relaxed);
                }
                let key = match error {
                    Error::Client { status, .. } | Error::UnexpectedStatus { status, .. } => {
                        format!("{}:{status}", error.code().as_str())
                    }
                    _ => error.code().as_str().to_owned(),
                };
                let mut error_counts = lock_unpoisoned(&self.inner.error_counts);
                *error_counts.entry(key).or_insert(0) += 1;
            }
        }
    }

    pub(crate) fn snapshot(&self, credential_refreshes: u64) -> MetricsSnapshot {
        let latency_samples = self.inner.latency_samples.load(Ordering::Relaxed);
        let latency_total_ms = self.inner.latency_total_ms.load(Ordering::Relaxed);
        let latency_avg_ms = if latency_samples == 0 {
            0.0
        } else {
            latency_total_ms as f64 / latency_samples as f64
        };

        MetricsSnapshot {
            calls_started: self.inner.calls_started.load(Ordering::Relaxed),
            calls_succeeded: self.inner.calls_succeeded.load(Ordering::Relaxed),
            calls_failed: self.inner.calls_failed.load(Ordering::Relaxed),
            attempts: self.inner.attempts.load(Ordering::Relaxed),
            retries: self.inner.retries.load(Ordering::Relaxed),
            circuit_rejections: self.inner.circuit_rejections.load(Ordering::Relaxed),
            credential_refreshes,
            in_flight: self.inner.in_flight.load(Ordering::Relaxed),
            latency_samples,
            latency_total_ms,
            latency_avg_ms,
            error_counts: lock_unpoisoned(&self.inner.error_counts).clone(),
        }
    }

    fn record_latency(&self, latency: Duration) {
        self.inner.latency_samples.fetch_add(1, Ordering::Relaxed);
        self.inner.latency_total_ms.fetch_add(
            latency.as_millis().min(u64::MAX as u128) as u64,
            Ordering::Relaxed,
        );
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.metrics.inner.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
