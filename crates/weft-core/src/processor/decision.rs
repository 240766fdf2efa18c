//! Decision model: what to do with a failed task.
//!
//! Pure function of the message and the error; the processor carries the decision out
//! against the broker (only while the lease is still valid).

use std::sync::Arc;
use std::time::Duration;

use crate::handler::HandlerError;
use crate::task::{Task, TaskMessage};

/// Classifies whether an error counts against the retry budget.
pub type IsFailureFn = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

/// Called for every failed attempt before the decision is carried out.
pub type ErrorHandlerFn = Arc<dyn Fn(&Task, &HandlerError) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    /// Back to the retry set after `delay`.
    Retry { delay: Duration, is_failure: bool },

    /// Give up.
    Archive,
}

/// - not a failure: retry without touching `retried`
/// - budget spent or skip-retry: archive
/// - otherwise: retry with the computed delay
pub(crate) fn decide(
    msg: &TaskMessage,
    err: &HandlerError,
    is_failure: bool,
    delay: impl FnOnce() -> Duration,
) -> Decision {
    if !is_failure {
        return Decision::Retry {
            delay: delay(),
            is_failure: false,
        };
    }
    if msg.retried >= msg.retry || err.is_skip_retry() {
        return Decision::Archive;
    }
    Decision::Retry {
        delay: delay(),
        is_failure: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn msg(retry: u32, retried: u32) -> TaskMessage {
        let mut m = TaskMessage::new("x", vec![], "T1", "default");
        m.retry = retry;
        m.retried = retried;
        m
    }

    const DELAY: Duration = Duration::from_secs(20);

    #[rstest]
    #[case::first_failure(2, 0, false, true, Decision::Retry { delay: DELAY, is_failure: true })]
    #[case::second_failure(2, 1, false, true, Decision::Retry { delay: DELAY, is_failure: true })]
    #[case::budget_spent(2, 2, false, true, Decision::Archive)]
    #[case::skip_retry(5, 0, true, true, Decision::Archive)]
    #[case::not_a_failure(2, 2, false, false, Decision::Retry { delay: DELAY, is_failure: false })]
    #[case::zero_budget(0, 0, false, true, Decision::Archive)]
    fn failure_decisions(
        #[case] retry: u32,
        #[case] retried: u32,
        #[case] skip: bool,
        #[case] is_failure: bool,
        #[case] want: Decision,
    ) {
        let err = if skip {
            HandlerError::skip_retry("bad input")
        } else {
            HandlerError::new("boom")
        };
        assert_eq!(decide(&msg(retry, retried), &err, is_failure, || DELAY), want);
    }
}
