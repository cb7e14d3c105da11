//! Reconnect backoff as a pure function of retry count, so it unit-tests
//! without real delays.

use std::time::Duration;

/// Delay before the first retry.
pub const BASE: Duration = Duration::from_secs(1);

/// Upper bound on any single delay.
pub const CAP: Duration = Duration::from_secs(30);

/// Exponential backoff: `BASE * 2^retry`, capped at [`CAP`].
///
/// `retry` is zero-based: the first reconnect waits [`BASE`].
pub fn backoff_delay(retry: u32) -> Duration {
    let factor = 1u64 << retry.min(32);
    BASE.saturating_mul(factor.min(u32::MAX as u64) as u32).min(CAP)
}
