use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;

/// Source of time for retry and poll loops.
///
/// `now()` is the elapsed time since the clock's origin, not wall-clock
/// time. Boot loops only ever compare points on the same clock, so a
/// monotonic offset is all they need.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Elapsed time since the clock origin.
    fn now(&self) -> Duration;

    /// Suspend the caller for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by tokio's timer.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock for tests. `sleep` advances time instantly and records
/// the requested duration.
#[derive(Debug, Default)]
pub struct ManualClock {
    elapsed_ms: AtomicU64,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward without recording a sleep.
    pub fn advance(&self, duration: Duration) {
        self.elapsed_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst))
    }

    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// The caller ran out of time before reaching a decision.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("deadline exceeded after {elapsed:?}")]
pub struct DeadlineExceeded {
    pub elapsed: Duration,
}

/// Hard outer bound on a blocking boot phase, expressed as a point on a
/// [`Clock`]. `Deadline::none()` never expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deadline {
    at: Option<Duration>,
}

impl Deadline {
    pub fn none() -> Self {
        Self { at: None }
    }

    /// Deadline `budget` from the clock's current time.
    pub fn after(clock: &dyn Clock, budget: Duration) -> Self {
        Self {
            at: Some(clock.now() + budget),
        }
    }

    /// Deadline at an absolute point on the clock.
    pub fn at(point: Duration) -> Self {
        Self { at: Some(point) }
    }

    pub fn remaining(&self, clock: &dyn Clock) -> Option<Duration> {
        self.at.map(|at| at.saturating_sub(clock.now()))
    }

    pub fn is_expired(&self, clock: &dyn Clock) -> bool {
        matches!(self.at, Some(at) if clock.now() >= at)
    }

    pub fn check(&self, clock: &dyn Clock) -> Result<(), DeadlineExceeded> {
        if self.is_expired(clock) {
            return Err(DeadlineExceeded {
                elapsed: clock.now(),
            });
        }
        Ok(())
    }

    /// Whether sleeping for `duration` would still end before the deadline.
    pub fn allows_sleep(&self, clock: &dyn Clock, duration: Duration) -> bool {
        match self.at {
            Some(at) => clock.now() + duration < at,
            None => true,
        }
    }
}

/// Wall-clock time for status records and markers, RFC 3339 in UTC with
/// millisecond precision. Never used for deadline arithmetic.
pub fn wall_time() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
