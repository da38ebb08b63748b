use rand::{Rng, RngCore};
use std::time::Duration;

/// Equal-jitter delay: uniform in `[backoff / 2, backoff]`.
///
/// Keeps retry storms from synchronizing across clients while never
/// shrinking the delay below half the nominal backoff.
pub(crate) fn jittered_backoff(rng: &mut impl RngCore, backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as u64;
    if backoff_ms <= 1 {
        return backoff;
    }
    let half = backoff_ms / 2;
    Duration::from_millis(half.saturating_add(rng.gen_range(0..=half)))
}
