//! Retry backoff.
//!
//! Delay computation for the check runtime's retry loop. The policy
//! itself ([`RetrySpec`]) lives on the check spec; transient/terminal
//! classification lives on [`EngineError`](crate::error::EngineError).

use rand::RngExt;

use crate::spec::RetrySpec;

/// Calculate the delay before a given retry attempt.
///
/// Formula: `base_delay × backoff^(attempt - 1)`, capped at
/// [`MAX_DELAY_MS`]. When jitter is enabled, the delay is multiplied by
/// a random factor in `[0.5, 1.5)`; it is off by default so that
/// re-runs with identical inputs behave identically.
///
/// `attempt` is 1-based (delay before the first retry = attempt 1).
#[must_use]
pub fn delay_for_attempt(attempt: u32, spec: &RetrySpec) -> std::time::Duration {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]
    let base = (spec.base_delay.inner().as_millis() as f64)
        * spec.backoff.powi(i32::saturating_sub(attempt as i32, 1));
    #[allow(clippy::cast_precision_loss)]
    let capped = base.min(MAX_DELAY_MS as f64);

    let final_ms = if spec.jitter {
        let jitter_factor = rand::rng().random_range(0.5..1.5);
        capped * jitter_factor
    } else {
        capped
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    std::time::Duration::from_millis(final_ms.max(0.0) as u64)
}

/// Cap on any single retry delay, in milliseconds.
pub const MAX_DELAY_MS: u64 = 60_000;
