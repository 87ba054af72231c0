//! Reconnection backoff schedule.

use std::time::Duration;

/// Calculate the exponential backoff delay for a reconnection attempt.
///
/// The first retry is `attempt = 1`. The exponent saturates at 2^10 and
/// the result, jitter included, never exceeds `max`.
pub(crate) fn delay_for_attempt(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as f64;
    let exp = 2.0_f64.powi(attempt.min(10) as i32);
    let delay = (base_ms * exp) as u64;

    // Add jitter (up to 20%)
    let jitter = (delay as f64 * 0.2 * rand::random::<f64>()) as u64;

    Duration::from_millis((delay + jitter).min(max.as_millis() as u64))
}
