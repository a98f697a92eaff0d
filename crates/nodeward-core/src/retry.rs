use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::clock::Clock;

/// Retry a fallible async operation with exponential backoff.
///
/// - `max_attempts`: Total attempts (including the first).
/// - `base_delay`: Delay after first failure, doubled on each subsequent failure.
/// - `label`: Description for log messages.
/// - `f`: The closure to retry.
pub async fn retry<F, Fut, T>(
    clock: &dyn Clock,
    max_attempts: u32,
    base_delay: Duration,
    label: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = base_delay;
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) if attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "{} failed, retrying",
                    label,
                );
                clock.sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => return Err(e.context(format!("{} failed after {} attempts", label, attempt))),
        }
    }
}
