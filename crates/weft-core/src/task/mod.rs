//! Task - ジョブの表現
//!
//! - [`Task`]: 呼び出し側が作る単位（kind + payload + 既定 option）。ハンドラにも渡される
//! - [`TaskMessage`]: broker に保存される正本
//! - [`TaskInfo`]: enqueue の結果として呼び出し側に返す要約

pub mod message;
pub mod options;
pub mod state;

use chrono::{DateTime, Utc};

pub use self::message::{DEFAULT_TIMEOUT, MESSAGE_VERSION, TaskMessage};
pub use self::options::{DEFAULT_MAX_RETRY, DEFAULT_QUEUE, OptionType, ResolvedOptions, TaskOption};
pub use self::state::TaskState;

/// Kind + payload, plus the options this task is enqueued with by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    kind: String,
    payload: Vec<u8>,
    opts: Vec<TaskOption>,
}

impl Task {
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
            opts: Vec::new(),
        }
    }

    pub fn with_options(mut self, opts: impl IntoIterator<Item = TaskOption>) -> Self {
        self.opts.extend(opts);
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn options(&self) -> &[TaskOption] {
        &self.opts
    }

    pub(crate) fn from_message(msg: &TaskMessage) -> Self {
        Self::new(msg.kind.clone(), msg.payload.clone())
    }
}

/// What the caller gets back from a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub queue: String,
    pub kind: String,
    pub state: TaskState,
    pub max_retry: u32,
    pub retried: u32,
    pub next_process_at: DateTime<Utc>,
    pub timeout_secs: i64,
    pub deadline: Option<DateTime<Utc>>,
    pub retention_secs: i64,
}

impl TaskInfo {
    pub(crate) fn new(msg: &TaskMessage, state: TaskState, next_process_at: DateTime<Utc>) -> Self {
        Self {
            id: msg.id.clone(),
            queue: msg.queue.clone(),
            kind: msg.kind.clone(),
            state,
            max_retry: msg.retry,
            retried: msg.retried,
            next_process_at,
            timeout_secs: msg.timeout,
            deadline: (msg.deadline > 0)
                .then(|| DateTime::<Utc>::from_timestamp(msg.deadline, 0))
                .flatten(),
            retention_secs: msg.retention,
        }
    }
}
