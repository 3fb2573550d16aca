//! Retry backoff computation.

use std::time::Duration;

use veriflow_types::BackoffStrategy;

/// Compute the delay before retry `attempt` (1-based).
///
/// - `fixed`: always the base delay
/// - `linear`: base delay multiplied by the attempt number
/// - `exponential`: base delay doubled per attempt
///
/// Every strategy is capped at `max`.
pub fn backoff_delay(
    strategy: BackoffStrategy,
    attempt: u32,
    base: Duration,
    max: Duration,
) -> Duration {
    let attempt = attempt.max(1);

    let delay = match strategy {
        BackoffStrategy::Fixed => base,
        BackoffStrategy::Linear => base.checked_mul(attempt).unwrap_or(max),
        BackoffStrategy::Exponential => {
            let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
            base.checked_mul(factor).unwrap_or(max)
        }
    };

    std::cmp::min(delay, max)
}
