//! Broker port - キューの状態遷移をすべて担う
//!
//! 各メソッドは 1 つの原子的な遷移に対応する。
//! Redis 実装ではサーバ側 Lua スクリプト 1 本、インメモリ実装ではロック 1 回で完結させ、
//! 途中状態（active から消えたが retry に入っていない、など）を外から観測できないようにする。
//!
//! # 実装
//! - [`RedisBroker`]: 本番用
//! - [`InMemoryBroker`]: テスト / ローカル実行用（同じ状態機械、Clock 注入可）

pub mod memory;
pub mod redis;
pub mod scripts;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::presence::{SchedulerEnqueueEvent, SchedulerEntry, ServerInfo, WorkerInfo};
use crate::task::{TaskMessage, TaskState};

pub use self::memory::InMemoryBroker;
pub use self::redis::RedisBroker;

/// Lease granted on dequeue.
pub const LEASE_DURATION: Duration = Duration::from_secs(30 * 60);

/// Daily stats counters expire after this long.
pub const STATS_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Archived tasks older than this are trimmed on the next archive.
pub const ARCHIVED_EXPIRATION_DAYS: i64 = 90;

/// Upper bound on the archived set.
pub const MAX_ARCHIVE_SIZE: i64 = 10_000;

/// Tasks moved per forward script call.
pub const FORWARD_BATCH_SIZE: usize = 100;

/// Completed tasks deleted per script call.
pub const DELETE_COMPLETED_BATCH_SIZE: usize = 100;

/// Enqueue events kept per scheduler entry.
pub const MAX_SCHEDULER_EVENTS: usize = 1000;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn ping(&self) -> Result<()>;

    /// `Error::TaskIdConflict` if the ID is taken.
    async fn enqueue(&self, msg: &TaskMessage) -> Result<()>;

    /// `Error::DuplicateTask` if the uniqueness lock is held, `Error::TaskIdConflict` if the ID is taken.
    async fn enqueue_unique(&self, msg: &TaskMessage, ttl: Duration) -> Result<()>;

    /// Pop one task from the first non-empty, non-paused queue, in the given order.
    ///
    /// Returns the message and its lease expiration, or `Error::NoProcessableTask`.
    async fn dequeue(&self, queues: &[String]) -> Result<(TaskMessage, DateTime<Utc>)>;

    /// Active -> deleted.
    async fn done(&self, msg: &TaskMessage) -> Result<()>;

    /// Active -> completed, kept until `now + msg.retention`.
    async fn mark_as_complete(&self, msg: &TaskMessage) -> Result<()>;

    /// Active -> pending (head of the list).
    async fn requeue(&self, msg: &TaskMessage) -> Result<()>;

    async fn schedule(&self, msg: &TaskMessage, process_at: DateTime<Utc>) -> Result<()>;

    async fn schedule_unique(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()>;

    /// Active -> retry. `is_failure` bumps `retried` and the failure counters.
    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        err_msg: &str,
        is_failure: bool,
    ) -> Result<()>;

    /// Active -> archived. Terminal.
    async fn archive(&self, msg: &TaskMessage, err_msg: &str) -> Result<()>;

    /// Move due scheduled/retry tasks into pending. Returns how many moved.
    async fn forward_if_ready(&self, queues: &[String]) -> Result<usize>;

    /// Returns how many completed tasks were deleted.
    async fn delete_expired_completed_tasks(&self, queue: &str) -> Result<usize>;

    async fn list_lease_expired(
        &self,
        cutoff: DateTime<Utc>,
        queues: &[String],
    ) -> Result<Vec<TaskMessage>>;

    /// Bump leases that already exist; never creates new ones. Returns the new expiration.
    async fn extend_lease(&self, queue: &str, ids: &[String]) -> Result<DateTime<Utc>>;

    async fn write_server_state(
        &self,
        info: &ServerInfo,
        workers: &[WorkerInfo],
        ttl: Duration,
    ) -> Result<()>;

    async fn clear_server_state(&self, host: &str, pid: u32, server_id: &str) -> Result<()>;

    async fn write_scheduler_entries(
        &self,
        scheduler_id: &str,
        entries: &[SchedulerEntry],
        ttl: Duration,
    ) -> Result<()>;

    async fn clear_scheduler_entries(&self, scheduler_id: &str) -> Result<()>;

    async fn record_scheduler_enqueue_event(
        &self,
        entry_id: &str,
        event: &SchedulerEnqueueEvent,
    ) -> Result<()>;

    async fn clear_scheduler_history(&self, entry_id: &str) -> Result<()>;

    /// Store handler output on the task hash. Returns the number of bytes written.
    async fn write_result(&self, queue: &str, id: &str, data: &[u8]) -> Result<usize>;

    async fn pause(&self, queue: &str) -> Result<()>;

    async fn unpause(&self, queue: &str) -> Result<()>;

    async fn all_queues(&self) -> Result<Vec<String>>;

    /// `state` field of the task hash, if the hash exists.
    async fn task_state(&self, queue: &str, id: &str) -> Result<Option<TaskState>>;
}
