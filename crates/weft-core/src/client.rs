//! Client - タスクを enqueue する側
//!
//! # フロー
//! 1. タスク側の option → 呼び出し側の option の順に合成（後勝ち）
//! 2. timeout も deadline もなければ `DEFAULT_TIMEOUT`
//! 3. Unique が指定されたときだけ uniqueness key を計算
//! 4. process-at が未来なら schedule、そうでなければ enqueue

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::broker::Broker;
use crate::error::Result;
use crate::keys::KeySpace;
use crate::ports::{Clock, SystemClock};
use crate::task::{DEFAULT_TIMEOUT, ResolvedOptions, Task, TaskInfo, TaskMessage, TaskOption, TaskState};

#[derive(Clone)]
pub struct Client {
    broker: Arc<dyn Broker>,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
}

impl Client {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            keys: KeySpace::default(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Key space used to derive uniqueness keys; must match the broker's.
    pub fn with_keys(mut self, keys: KeySpace) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Enqueue `task`. `opts` override the task's own options.
    ///
    /// Duplicate and ID-conflict errors come back as [`crate::Error::DuplicateTask`] /
    /// [`crate::Error::TaskIdConflict`]; see [`crate::Error::is_already_exists`].
    pub async fn enqueue(&self, task: &Task, opts: &[TaskOption]) -> Result<TaskInfo> {
        let now = self.clock.now();
        let resolved = ResolvedOptions::resolve(task.options().iter().chain(opts), now)?;
        let msg = self.build_message(task, &resolved);

        let state = if resolved.process_at > now {
            self.schedule(&msg, resolved.process_at, &resolved).await?;
            TaskState::Scheduled
        } else {
            self.enqueue_now(&msg, &resolved).await?;
            TaskState::Pending
        };
        debug!(task_id = %msg.id, queue = %msg.queue, kind = %msg.kind, state = %state.as_str(), "task enqueued");
        Ok(TaskInfo::new(&msg, state, resolved.process_at.max(now)))
    }

    fn build_message(&self, task: &Task, resolved: &ResolvedOptions) -> TaskMessage {
        let mut msg = TaskMessage::new(
            task.kind(),
            task.payload().to_vec(),
            resolved.task_id.clone(),
            resolved.queue.clone(),
        );
        msg.retry = resolved.max_retry;
        msg.timeout = resolved.timeout.map(secs).unwrap_or(0);
        msg.deadline = resolved.deadline.map(|d| d.timestamp()).unwrap_or(0);
        if msg.timeout == 0 && msg.deadline == 0 {
            msg.timeout = secs(DEFAULT_TIMEOUT);
        }
        if resolved.unique_ttl.is_some() {
            msg.unique_key = self.keys.unique(&msg.queue, &msg.kind, &msg.payload);
        }
        msg.retention = resolved.retention.map(secs).unwrap_or(0);
        msg
    }

    async fn enqueue_now(&self, msg: &TaskMessage, resolved: &ResolvedOptions) -> Result<()> {
        match resolved.unique_ttl {
            Some(ttl) => self.broker.enqueue_unique(msg, ttl).await,
            None => self.broker.enqueue(msg).await,
        }
    }

    async fn schedule(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        resolved: &ResolvedOptions,
    ) -> Result<()> {
        match resolved.unique_ttl {
            // ロックは実行予定時刻まで + ttl だけ保持する
            Some(ttl) => {
                let until = (process_at - self.clock.now()).to_std().unwrap_or_default();
                self.broker.schedule_unique(msg, process_at, until + ttl).await
            }
            None => self.broker.schedule(msg, process_at).await,
        }
    }
}

fn secs(d: std::time::Duration) -> i64 {
    i64::try_from(d.as_secs()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::error::Error;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use std::time::Duration;

    fn setup() -> (Client, InMemoryBroker, FixedClock) {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        let broker = InMemoryBroker::with_clock(Arc::new(clock.clone()));
        let client = Client::new(Arc::new(broker.clone())).with_clock(Arc::new(clock.clone()));
        (client, broker, clock)
    }

    #[tokio::test]
    async fn defaults_land_in_the_default_queue() {
        let (client, broker, clock) = setup();
        let info = client
            .enqueue(&Task::new("email:send", b"{}".to_vec()), &[])
            .await
            .unwrap();

        assert_eq!(info.queue, "default");
        assert_eq!(info.state, TaskState::Pending);
        assert_eq!(info.max_retry, 10);
        assert_eq!(info.next_process_at, clock.now());

        let msg = broker.message("default", &info.id).await.unwrap();
        assert_eq!(msg.timeout, 30 * 60);
        assert_eq!(msg.deadline, 0);
        assert!(msg.unique_key.is_empty());
    }

    #[tokio::test]
    async fn call_options_override_task_options() {
        let (client, broker, _) = setup();
        let task = Task::new("report", vec![]).with_options([
            TaskOption::Queue("low".into()),
            TaskOption::MaxRetry(1),
        ]);
        let info = client
            .enqueue(
                &task,
                &[TaskOption::Queue("critical".into()), TaskOption::TaskId("R1".into())],
            )
            .await
            .unwrap();

        assert_eq!(info.id, "R1");
        assert_eq!(info.queue, "critical");
        assert_eq!(info.max_retry, 1);
        assert_eq!(broker.counters("critical").await.pending, 1);
    }

    #[tokio::test]
    async fn deadline_alone_does_not_get_a_default_timeout() {
        let (client, broker, clock) = setup();
        let deadline = clock.now() + chrono::Duration::hours(1);
        let info = client
            .enqueue(&Task::new("x", vec![]), &[TaskOption::Deadline(deadline)])
            .await
            .unwrap();

        let msg = broker.message("default", &info.id).await.unwrap();
        assert_eq!(msg.timeout, 0);
        assert_eq!(msg.deadline, deadline.timestamp());
        assert_eq!(info.deadline, Some(deadline));
    }

    #[tokio::test]
    async fn future_process_at_schedules() {
        let (client, broker, clock) = setup();
        let info = client
            .enqueue(
                &Task::new("x", vec![]),
                &[TaskOption::ProcessAfter(Duration::from_secs(60))],
            )
            .await
            .unwrap();

        assert_eq!(info.state, TaskState::Scheduled);
        assert_eq!(info.next_process_at, clock.now() + chrono::Duration::seconds(60));
        let counters = broker.counters("default").await;
        assert_eq!(counters.scheduled, 1);
        assert_eq!(counters.pending, 0);
    }

    #[tokio::test]
    async fn unique_tasks_are_rejected_while_locked() {
        let (client, _, _) = setup();
        let task = Task::new("x", b"same".to_vec()).with_options([TaskOption::Unique(Duration::from_secs(60))]);

        client.enqueue(&task, &[]).await.unwrap();
        let err = client.enqueue(&task, &[]).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateTask(_)));
        assert!(err.is_already_exists());

        // 別の payload なら別キー
        client
            .enqueue(&Task::new("x", b"other".to_vec()), &[TaskOption::Unique(Duration::from_secs(60))])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unique_key_is_recorded_on_the_message() {
        let (client, broker, _) = setup();
        let info = client
            .enqueue(
                &Task::new("x", b"p".to_vec()),
                &[TaskOption::Unique(Duration::from_secs(60))],
            )
            .await
            .unwrap();
        let msg = broker.message("default", &info.id).await.unwrap();
        assert_eq!(msg.unique_key, KeySpace::default().unique("default", "x", b"p"));
    }

    #[tokio::test]
    async fn explicit_id_reuse_is_a_conflict() {
        let (client, _, _) = setup();
        let opts = [TaskOption::TaskId("same".into())];
        client.enqueue(&Task::new("x", vec![]), &opts).await.unwrap();
        let err = client.enqueue(&Task::new("x", vec![]), &opts).await.unwrap_err();
        assert!(matches!(err, Error::TaskIdConflict));
    }

    #[tokio::test]
    async fn invalid_options_never_reach_the_broker() {
        let (client, broker, _) = setup();
        let err = client
            .enqueue(&Task::new("x", vec![]), &[TaskOption::Unique(Duration::from_millis(10))])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOption(_)));
        assert_eq!(broker.all_queues().await.unwrap(), Vec::<String>::new());
    }
}
