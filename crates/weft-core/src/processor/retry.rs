//! Retry delay.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::handler::HandlerError;
use crate::task::Task;

/// `(retried so far, error, task) -> delay before the next attempt`
pub type RetryDelayFn = Arc<dyn Fn(u32, &HandlerError, &Task) -> Duration + Send + Sync>;

/// `n^4 + 15 + rand(0..30) * (n + 1)` seconds.
pub fn default_retry_delay(retried: u32, _err: &HandlerError, _task: &Task) -> Duration {
    let jitter = rand::thread_rng().gen_range(0..30);
    backoff(retried, jitter)
}

fn backoff(n: u32, jitter: u64) -> Duration {
    let n = u64::from(n);
    let secs = n
        .saturating_pow(4)
        .saturating_add(15)
        .saturating_add(jitter.saturating_mul(n + 1));
    Duration::from_secs(secs)
}
