use rand::Rng;
use std::time::Duration;

/// Base delay, in seconds, before the first retry.
const BASE_SECS: u64 = 30;
/// Ceiling for the exponential component, in seconds.
const CAP_SECS: u64 = 3600;
/// Upper bound (inclusive) of the random jitter, in seconds.
const JITTER_SECS: u64 = 15;

/// Capped exponential backoff with a small random jitter.
///
/// The jitter keeps many tasks that failed at the same moment from
/// synchronizing their retries into a single storm.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy;

impl RetryPolicy {
    /// Delay before the next attempt. `attempt` is the number of attempts
    /// already made (1 after the first failure).
    ///
    /// `min(3600, 30 * 2^(attempt-1)) + jitter[0,15]` seconds.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_secs(attempt);
        let jitter = rand::rng().random_range(0..=JITTER_SECS);
        Duration::from_secs(base + jitter)
    }

    /// The deterministic part of the delay, without jitter.
    pub fn base_delay_secs(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(63);
        BASE_SECS.saturating_mul(1u64 << exp).min(CAP_SECS)
    }
}
