//! Jittered exponential backoff for retryable send failures.

use {chrono::Duration, rand::Rng, switchboard_config::OutboxPolicy};

/// Backoff before the next attempt, without jitter.
///
/// Doubles per attempt starting from the base delay, capped at the
/// configured ceiling. `attempt` is the attempt that just failed,
/// starting at 1.
#[must_use]
pub fn base_delay_ms(policy: &OutboxPolicy, attempt: u32) -> u64 {
    let exponent = attempt.saturating_sub(1).min(16);
    policy
        .base_backoff_ms
        .saturating_mul(1u64 << exponent)
        .min(policy.max_backoff_ms)
}

/// Backoff with up to `jitter_ratio` of random spread added, so a burst of
/// failures does not retry in lockstep.
#[must_use]
pub fn jittered_delay(policy: &OutboxPolicy, attempt: u32) -> Duration {
    let base = base_delay_ms(policy, attempt);
    let jitter_max = (base as f64 * policy.jitter_ratio) as u64;
    let jitter = if jitter_max == 0 {
        0
    } else {
        rand::rng().random_range(0..=jitter_max)
    };
    Duration::milliseconds(base.saturating_add(jitter) as i64)
}
