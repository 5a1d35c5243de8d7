//! Sync and evaluation pipelines
//!
//! - [`SyncDriver`]: remote source → merge into the conversation store → advance watermark
//! - [`EvaluationDriver`]: eligible conversations → evaluator → evaluation store
//!
//! Each driver exposes one `run_cycle` and implements
//! [`PeriodicJob`](crate::scheduler::PeriodicJob) so it can be wrapped in a
//! [`PollingLoop`](crate::scheduler::PollingLoop).

pub mod evaluation;
pub mod sync;

pub use evaluation::{EvaluationDriver, EvaluationReport};
pub use sync::{SyncDriver, SyncReport};

use std::time::Duration;

/// Delay before the next attempt after `attempts` consecutive failures
///
/// `base · 2^(attempts-1)`, capped at `max`.
pub fn retry_delay(base: Duration, max: Duration, attempts: u32) -> Duration {
    let exponent = attempts.saturating_sub(1);
    2u32.checked_pow(exponent)
        .and_then(|factor| base.checked_mul(factor))
        .map(|delay| delay.min(max))
        .unwrap_or(max)
}
