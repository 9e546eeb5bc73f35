use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::util::lock_unpoisoned;

// Far enough for any recovery window or token lifetime, near enough to stay representable.
const MAX_OFFSET: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Monotonic time source shared by the circuit breaker and the credential manager.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Useful for driving breaker recovery windows and credential expiry in tests
/// without sleeping. Advancing saturates at roughly a century past creation.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    horizon: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        let origin = Instant::now();
        Self {
            origin,
            horizon: origin.checked_add(MAX_OFFSET).unwrap_or(origin),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = lock_unpoisoned(&self.offset);
        *offset = offset.saturating_add(by).min(MAX_OFFSET);
    }

    pub fn elapsed(&self) -> Duration {
        *lock_unpoisoned(&self.offset)
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *lock_unpoisoned(&self.offset);
        self.origin.checked_add(offset).unwrap_or(self.horizon)
    }
}
