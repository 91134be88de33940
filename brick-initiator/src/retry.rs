//! Bounded polling for devices that appear asynchronously.
//!
//! The kernel publishes a device node some time after a login or rescan.
//! [`poll_with_rescan`] probes, triggers a rescan and backs off, for a fixed
//! number of attempts, then probes one last time.

use std::thread;
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Sleep `attempt² × unit` after attempt `attempt` (0, 1, 4, 9, ...).
    Quadratic(Duration),
    /// Sleep the same interval after every attempt.
    Fixed(Duration),
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Quadratic(unit) => unit.saturating_mul(attempt.saturating_mul(attempt)),
            Backoff::Fixed(interval) => interval,
        }
    }

    /// Total sleep over `attempts` attempts.
    pub fn total(&self, attempts: u32) -> Duration {
        (0..attempts).map(|attempt| self.delay(attempt)).sum()
    }
}

/// Poll `probe` until it yields a value.
///
/// Each of the `attempts` rounds probes, calls `rescan` with the attempt
/// number and sleeps per `backoff`; a final probe follows the last round.
/// Returns `Ok(None)` once the budget is spent, so `rescan` has run exactly
/// `attempts` times. Rescan errors abort the loop.
pub fn poll_with_rescan<T, E>(
    attempts: u32,
    backoff: Backoff,
    mut probe: impl FnMut() -> Option<T>,
    mut rescan: impl FnMut(u32) -> Result<(), E>,
) -> Result<Option<T>, E> {
    for attempt in 0..attempts {
        if let Some(found) = probe() {
            return Ok(Some(found));
        }
        rescan(attempt)?;
        let delay = backoff.delay(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Backing off before next probe");
        thread::sleep(delay);
    }
    let found = probe();
    if found.is_none() {
        debug!(
            attempts,
            waited_ms = backoff.total(attempts).as_millis() as u64,
            "Polling exhausted"
        );
    }
    Ok(found)
}
