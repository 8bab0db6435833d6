use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter, capped so repeated retries do not grow
/// unbounded. `attempt` is zero-based.
pub(crate) fn retry_delay(base: Duration, attempt: usize, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(10) as u32);
    let capped = exp.min(cap);
    let jitter_max = (capped.as_millis() as u64 / 4).max(1);
    let jitter = rand::thread_rng().gen_range(0..jitter_max);
    capped + Duration::from_millis(jitter)
}
