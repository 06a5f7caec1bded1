//! Time utilities shared by the worker and the store

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// A clock set before the Unix epoch yields 0 rather than panicking, which
/// makes every `last_check` look stale and forces a fresh pass.
///
/// # Examples
/// ```
/// use sc_core::time::current_time_millis;
///
/// let now = current_time_millis();
/// assert!(now > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Calculate elapsed time in milliseconds since a given timestamp.
///
/// Returns 0 if the given time is in the future.
pub fn elapsed_millis(since: u64) -> u64 {
    current_time_millis().saturating_sub(since)
}

/// Calculate elapsed time as a Duration since a given millisecond timestamp.
pub fn elapsed_duration(since_millis: u64) -> Duration {
    Duration::from_millis(elapsed_millis(since_millis))
}

/// Whether `at` is strictly later than `reference`, treating a missing
/// reference as infinitely old.
pub fn is_after(at: Option<u64>, reference: Option<u64>) -> bool {
    match (at, reference) {
        (Some(at), Some(reference)) => at > reference,
        (Some(_), None) => true,
        (None, _) => false,
    }
}
