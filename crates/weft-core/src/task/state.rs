//! Task state as stored in the `state` field of a task hash.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// State transitions (driven only by broker scripts):
/// - Pending -> Active -> (deleted) | Completed
/// - Pending -> Active -> Retry -> Pending (forwarded)
/// - Pending -> Active -> Archived
/// - Scheduled -> Pending (forwarded)
/// - Active -> Pending (requeued on shutdown)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Active,
    Scheduled,
    Retry,
    Archived,
    Completed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Active => "active",
            TaskState::Scheduled => "scheduled",
            TaskState::Retry => "retry",
            TaskState::Archived => "archived",
            TaskState::Completed => "completed",
        }
    }

    /// Is this a terminal state (no further automatic transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Archived | TaskState::Completed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "active" => Ok(TaskState::Active),
            "scheduled" => Ok(TaskState::Scheduled),
            "retry" => Ok(TaskState::Retry),
            "archived" => Ok(TaskState::Archived),
            "completed" => Ok(TaskState::Completed),
            other => Err(Error::Internal(format!("unknown task state {other:?}"))),
        }
    }
}
