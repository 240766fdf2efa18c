//! TaskContext - ハンドラに渡される実行コンテキスト
//!
//! タスクの識別情報、期限、キャンセル、結果の書き込み口をまとめたもの。
//! 期限を過ぎたりリースが切れたりした場合、processor 側がハンドラの future を破棄するので、
//! ハンドラは [`TaskContext::cancelled`] を見て後始末だけすればよい。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::broker::Broker;
use crate::error::Result;
use crate::task::TaskMessage;

#[derive(Clone)]
pub struct TaskContext {
    task_id: String,
    queue: String,
    retry_count: u32,
    max_retry: u32,
    deadline: DateTime<Utc>,
    cancel: CancellationToken,
    result_writer: ResultWriter,
}

impl TaskContext {
    pub(crate) fn new(
        msg: &TaskMessage,
        deadline: DateTime<Utc>,
        cancel: CancellationToken,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            task_id: msg.id.clone(),
            queue: msg.queue.clone(),
            retry_count: msg.retried,
            max_retry: msg.retry,
            deadline,
            cancel,
            result_writer: ResultWriter {
                broker,
                queue: msg.queue.clone(),
                task_id: msg.id.clone(),
            },
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Failed attempts before this one.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retry(&self) -> u32 {
        self.max_retry
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the task is cancelled, its deadline passes, or the server aborts it.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn result_writer(&self) -> &ResultWriter {
        &self.result_writer
    }
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext")
            .field("task_id", &self.task_id)
            .field("queue", &self.queue)
            .field("retry_count", &self.retry_count)
            .field("max_retry", &self.max_retry)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Stores handler output in the `result` field of the task hash.
#[derive(Clone)]
pub struct ResultWriter {
    broker: Arc<dyn Broker>,
    queue: String,
    task_id: String,
}

impl ResultWriter {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Returns the number of bytes written.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        self.broker.write_result(&self.queue, &self.task_id, data).await
    }
}

/// In-flight task ID -> cancellation token.
#[derive(Debug, Clone, Default)]
pub struct Cancellations {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl Cancellations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, task_id: &str, token: CancellationToken) {
        self.lock().insert(task_id.to_string(), token);
    }

    pub fn remove(&self, task_id: &str) {
        self.lock().remove(task_id);
    }

    /// Returns false if no task with this ID is running here.
    pub fn cancel(&self, task_id: &str) -> bool {
        match self.lock().get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}
