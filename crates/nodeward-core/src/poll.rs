use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::clock::{Clock, Deadline, DeadlineExceeded};

/// Outcome of a single poll attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// The awaited condition holds; stop polling.
    Ready(T),
    /// Not yet; wait one interval and try again. The string is logged.
    Retry(String),
    /// Polling cannot succeed; stop immediately.
    Fatal(E),
}

/// Why a poll loop stopped without a value.
#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
    #[error(transparent)]
    Deadline(#[from] DeadlineExceeded),
    #[error("{0}")]
    Fatal(E),
}

/// Value produced by a successful poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Polled<T> {
    pub value: T,
    /// 1-based attempt that produced the value.
    pub attempts: u32,
}

/// Fixed-interval poll loop with an optional attempt budget and a deadline.
///
/// Sleeps happen only between attempts, so `max_attempts = n` costs at most
/// `(n - 1) * interval`. A sleep that would cross the deadline fails the
/// loop with [`PollError::Deadline`] rather than sleeping past it.
pub struct Poller<'a> {
    clock: &'a dyn Clock,
    label: &'a str,
    interval: Duration,
    max_attempts: Option<u32>,
    deadline: Deadline,
}

impl<'a> Poller<'a> {
    pub fn new(clock: &'a dyn Clock, label: &'a str, interval: Duration) -> Self {
        Self {
            clock,
            label,
            interval,
            max_attempts: None,
            deadline: Deadline::none(),
        }
    }

    /// Bound the number of attempts. Zero is treated as one.
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max.max(1));
        self
    }

    pub fn deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn run<T, E, F, Fut>(&self, mut f: F) -> Result<Polled<T>, PollError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.deadline.check(self.clock)?;

            let reason = match f(attempt).await {
                Attempt::Ready(value) => {
                    debug!(attempt, label = self.label, "Poll condition reached");
                    return Ok(Polled {
                        value,
                        attempts: attempt,
                    });
                }
                Attempt::Fatal(e) => return Err(PollError::Fatal(e)),
                Attempt::Retry(reason) => reason,
            };

            if let Some(max) = self.max_attempts
                && attempt >= max
            {
                warn!(
                    attempts = attempt,
                    label = self.label,
                    last = %reason,
                    "Poll budget exhausted"
                );
                return Err(PollError::Exhausted {
                    attempts: attempt,
                    last: reason,
                });
            }

            if !self.deadline.allows_sleep(self.clock, self.interval) {
                return Err(PollError::Deadline(DeadlineExceeded {
                    elapsed: self.clock.now(),
                }));
            }

            debug!(
                attempt,
                max_attempts = self.max_attempts,
                interval_ms = self.interval.as_millis() as u64,
                label = self.label,
                reason = %reason,
                "Not ready, waiting"
            );
            self.clock.sleep(self.interval).await;
        }
    }
}
