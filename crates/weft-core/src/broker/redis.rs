//! Redis broker.
//!
//! 状態遷移はすべて [`scripts`](super::scripts) の Lua スクリプト経由。
//! スクリプトに含めないのは単発コマンド（キュー登録 SADD / pause / presence 索引の ZADD など）だけ。

use std::sync::Arc;
use std::time::Duration;

use ::redis::AsyncCommands;
use ::redis::aio::ConnectionManager;
use ::redis::{RedisError, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{
    ARCHIVED_EXPIRATION_DAYS, Broker, DELETE_COMPLETED_BATCH_SIZE, FORWARD_BATCH_SIZE,
    LEASE_DURATION, MAX_ARCHIVE_SIZE, MAX_SCHEDULER_EVENTS, STATS_TTL, scripts,
};
use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::keys::KeySpace;
use crate::ports::{Clock, SystemClock};
use crate::presence::{self, SchedulerEnqueueEvent, SchedulerEntry, ServerInfo, WorkerInfo};
use crate::task::{TaskMessage, TaskState};

struct Scripts {
    enqueue: Script,
    enqueue_unique: Script,
    dequeue: Script,
    done: Script,
    mark_as_complete: Script,
    requeue: Script,
    schedule: Script,
    schedule_unique: Script,
    retry: Script,
    archive: Script,
    forward: Script,
    delete_expired_completed: Script,
    list_lease_expired: Script,
    write_server_state: Script,
    clear_server_state: Script,
    write_scheduler_entries: Script,
    record_scheduler_enqueue_event: Script,
    write_result: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            enqueue: Script::new(scripts::ENQUEUE),
            enqueue_unique: Script::new(scripts::ENQUEUE_UNIQUE),
            dequeue: Script::new(scripts::DEQUEUE),
            done: Script::new(scripts::DONE),
            mark_as_complete: Script::new(scripts::MARK_AS_COMPLETE),
            requeue: Script::new(scripts::REQUEUE),
            schedule: Script::new(scripts::SCHEDULE),
            schedule_unique: Script::new(scripts::SCHEDULE_UNIQUE),
            retry: Script::new(scripts::RETRY),
            archive: Script::new(scripts::ARCHIVE),
            forward: Script::new(scripts::FORWARD),
            delete_expired_completed: Script::new(scripts::DELETE_EXPIRED_COMPLETED),
            list_lease_expired: Script::new(scripts::LIST_LEASE_EXPIRED),
            write_server_state: Script::new(scripts::WRITE_SERVER_STATE),
            clear_server_state: Script::new(scripts::CLEAR_SERVER_STATE),
            write_scheduler_entries: Script::new(scripts::WRITE_SCHEDULER_ENTRIES),
            record_scheduler_enqueue_event: Script::new(scripts::RECORD_SCHEDULER_ENQUEUE_EVENT),
            write_result: Script::new(scripts::WRITE_RESULT),
        }
    }
}

pub struct RedisBroker {
    conn: ConnectionManager,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
    scripts: Scripts,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager, keys: KeySpace) -> Self {
        Self {
            conn,
            keys,
            clock: Arc::new(SystemClock),
            lease_duration: LEASE_DURATION,
            scripts: Scripts::load(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// One connection attempt plus a PING.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let client = ::redis::Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        let broker = Self::new(conn, KeySpace::new(config.key_prefix.clone()));
        broker.ping().await?;
        Ok(broker)
    }

    /// [`RedisBroker::connect`] with `connect_attempts` tries, `connect_delay` apart.
    pub async fn connect_with_retry(config: &BrokerConfig) -> Result<Self> {
        let attempts = config.connect_attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::connect(config).await {
                Ok(broker) => return Ok(broker),
                Err(e) if attempt < attempts => {
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "redis connection failed, retrying"
                    );
                    tokio::time::sleep(config.connect_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn stats_expiration(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() + STATS_TTL.as_secs() as i64
    }

    async fn register_queue(&self, queue: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(self.keys.all_queues(), queue).await?;
        Ok(())
    }
}

/// `NOTFOUND` script replies become [`Error::TaskNotFound`].
fn task_error(err: RedisError, id: &str) -> Error {
    if err.code() == Some("NOTFOUND") {
        Error::TaskNotFound(id.to_string())
    } else {
        Error::Redis(err)
    }
}

fn unique_outcome(code: i64) -> Result<()> {
    match code {
        1 => Ok(()),
        0 => Err(Error::TaskIdConflict),
        -1 => Err(Error::DuplicateTask(
            "a task with the same uniqueness key already exists".into(),
        )),
        other => Err(Error::Internal(format!("unexpected script reply {other}"))),
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = ::redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn enqueue(&self, msg: &TaskMessage) -> Result<()> {
        self.register_queue(&msg.queue).await?;
        let now = self.now();
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.enqueue.prepare_invoke();
        inv.key(self.keys.task(&msg.queue, &msg.id))
            .key(self.keys.pending(&msg.queue))
            .arg(msg.encode()?)
            .arg(&msg.id)
            .arg(now.timestamp_nanos_opt().unwrap_or_default())
            .arg(msg.hash_ttl_secs(now));
        let code: i64 = inv.invoke_async(&mut conn).await?;
        unique_outcome(code)
    }

    async fn enqueue_unique(&self, msg: &TaskMessage, ttl: Duration) -> Result<()> {
        self.register_queue(&msg.queue).await?;
        let now = self.now();
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.enqueue_unique.prepare_invoke();
        inv.key(&msg.unique_key)
            .key(self.keys.task(&msg.queue, &msg.id))
            .key(self.keys.pending(&msg.queue))
            .arg(&msg.id)
            .arg(ttl.as_secs())
            .arg(msg.encode()?)
            .arg(now.timestamp_nanos_opt().unwrap_or_default())
            .arg(msg.hash_ttl_secs(now));
        let code: i64 = inv.invoke_async(&mut conn).await?;
        unique_outcome(code)
    }

    async fn dequeue(&self, queues: &[String]) -> Result<(TaskMessage, DateTime<Utc>)> {
        let mut conn = self.conn.clone();
        for queue in queues {
            let lease_expires_at = self.now()
                + chrono::Duration::from_std(self.lease_duration)
                    .map_err(|e| Error::Internal(e.to_string()))?;
            let mut inv = self.scripts.dequeue.prepare_invoke();
            inv.key(self.keys.pending(queue))
                .key(self.keys.paused(queue))
                .key(self.keys.active(queue))
                .key(self.keys.lease(queue))
                .arg(lease_expires_at.timestamp())
                .arg(self.keys.task_prefix(queue));
            let raw: Option<Vec<u8>> = inv.invoke_async(&mut conn).await?;
            if let Some(raw) = raw {
                let msg = TaskMessage::decode(&raw)?;
                debug!(task_id = %msg.id, queue = %queue, "dequeued");
                return Ok((msg, lease_expires_at));
            }
        }
        Err(Error::NoProcessableTask)
    }

    async fn done(&self, msg: &TaskMessage) -> Result<()> {
        let now = self.now();
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.done.prepare_invoke();
        inv.key(self.keys.active(&msg.queue))
            .key(self.keys.lease(&msg.queue))
            .key(self.keys.task(&msg.queue, &msg.id))
            .key(self.keys.processed(&msg.queue, now))
            .key(self.keys.processed_total(&msg.queue));
        if msg.has_unique_key() {
            inv.key(&msg.unique_key);
        }
        inv.arg(&msg.id)
            .arg(self.stats_expiration(now))
            .arg(i64::MAX);
        let _: () = inv
            .invoke_async(&mut conn)
            .await
            .map_err(|e| task_error(e, &msg.id))?;
        Ok(())
    }

    async fn mark_as_complete(&self, msg: &TaskMessage) -> Result<()> {
        let now = self.now();
        let mut completed = msg.clone();
        completed.completed_at = now.timestamp();

        let mut conn = self.conn.clone();
        let mut inv = self.scripts.mark_as_complete.prepare_invoke();
        inv.key(self.keys.active(&msg.queue))
            .key(self.keys.lease(&msg.queue))
            .key(self.keys.completed(&msg.queue))
            .key(self.keys.task(&msg.queue, &msg.id))
            .key(self.keys.processed(&msg.queue, now))
            .key(self.keys.processed_total(&msg.queue));
        if msg.has_unique_key() {
            inv.key(&msg.unique_key);
        }
        inv.arg(&msg.id)
            .arg(self.stats_expiration(now))
            .arg(now.timestamp() + msg.retention)
            .arg(completed.encode()?)
            .arg(i64::MAX);
        let _: () = inv
            .invoke_async(&mut conn)
            .await
            .map_err(|e| task_error(e, &msg.id))?;
        Ok(())
    }

    async fn requeue(&self, msg: &TaskMessage) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.requeue.prepare_invoke();
        inv.key(self.keys.active(&msg.queue))
            .key(self.keys.lease(&msg.queue))
            .key(self.keys.pending(&msg.queue))
            .key(self.keys.task(&msg.queue, &msg.id))
            .arg(&msg.id);
        let _: () = inv
            .invoke_async(&mut conn)
            .await
            .map_err(|e| task_error(e, &msg.id))?;
        Ok(())
    }

    async fn schedule(&self, msg: &TaskMessage, process_at: DateTime<Utc>) -> Result<()> {
        self.register_queue(&msg.queue).await?;
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.schedule.prepare_invoke();
        inv.key(self.keys.task(&msg.queue, &msg.id))
            .key(self.keys.scheduled(&msg.queue))
            .arg(msg.encode()?)
            .arg(process_at.timestamp())
            .arg(&msg.id);
        let code: i64 = inv.invoke_async(&mut conn).await?;
        unique_outcome(code)
    }

    async fn schedule_unique(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()> {
        self.register_queue(&msg.queue).await?;
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.schedule_unique.prepare_invoke();
        inv.key(&msg.unique_key)
            .key(self.keys.task(&msg.queue, &msg.id))
            .key(self.keys.scheduled(&msg.queue))
            .arg(&msg.id)
            .arg(ttl.as_secs())
            .arg(process_at.timestamp())
            .arg(msg.encode()?);
        let code: i64 = inv.invoke_async(&mut conn).await?;
        unique_outcome(code)
    }

    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        err_msg: &str,
        is_failure: bool,
    ) -> Result<()> {
        let now = self.now();
        let mut modified = msg.clone();
        if is_failure {
            modified.retried += 1;
        }
        modified.error_msg = err_msg.to_string();
        modified.last_failed_at = now.timestamp();

        let mut conn = self.conn.clone();
        let mut inv = self.scripts.retry.prepare_invoke();
        inv.key(self.keys.task(&msg.queue, &msg.id))
            .key(self.keys.active(&msg.queue))
            .key(self.keys.lease(&msg.queue))
            .key(self.keys.retry(&msg.queue))
            .key(self.keys.processed(&msg.queue, now))
            .key(self.keys.failed(&msg.queue, now))
            .key(self.keys.processed_total(&msg.queue))
            .key(self.keys.failed_total(&msg.queue))
            .arg(&msg.id)
            .arg(modified.encode()?)
            .arg(process_at.timestamp())
            .arg(self.stats_expiration(now))
            .arg(i32::from(is_failure))
            .arg(i64::MAX);
        let _: () = inv
            .invoke_async(&mut conn)
            .await
            .map_err(|e| task_error(e, &msg.id))?;
        Ok(())
    }

    async fn archive(&self, msg: &TaskMessage, err_msg: &str) -> Result<()> {
        let now = self.now();
        let cutoff = now - chrono::Duration::days(ARCHIVED_EXPIRATION_DAYS);
        debug!(task_id = %msg.id, error = err_msg, "archiving");

        let mut conn = self.conn.clone();
        let mut inv = self.scripts.archive.prepare_invoke();
        inv.key(self.keys.task(&msg.queue, &msg.id))
            .key(self.keys.active(&msg.queue))
            .key(self.keys.lease(&msg.queue))
            .key(self.keys.archived(&msg.queue))
            .key(self.keys.processed(&msg.queue, now))
            .key(self.keys.failed(&msg.queue, now))
            .key(self.keys.processed_total(&msg.queue))
            .key(self.keys.failed_total(&msg.queue))
            .arg(&msg.id)
            .arg(now.timestamp())
            .arg(cutoff.timestamp())
            .arg(MAX_ARCHIVE_SIZE)
            .arg(self.stats_expiration(now))
            .arg(i64::MAX);
        let _: () = inv
            .invoke_async(&mut conn)
            .await
            .map_err(|e| task_error(e, &msg.id))?;
        Ok(())
    }

    async fn forward_if_ready(&self, queues: &[String]) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut total = 0;
        for queue in queues {
            for source in [self.keys.scheduled(queue), self.keys.retry(queue)] {
                loop {
                    let now = self.now();
                    let mut inv = self.scripts.forward.prepare_invoke();
                    inv.key(&source)
                        .key(self.keys.pending(queue))
                        .arg(now.timestamp())
                        .arg(self.keys.task_prefix(queue))
                        .arg(now.timestamp_nanos_opt().unwrap_or_default())
                        .arg(FORWARD_BATCH_SIZE);
                    let moved: usize = inv.invoke_async(&mut conn).await?;
                    total += moved;
                    if moved == 0 {
                        break;
                    }
                }
            }
        }
        Ok(total)
    }

    async fn delete_expired_completed_tasks(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut total = 0;
        loop {
            let mut inv = self.scripts.delete_expired_completed.prepare_invoke();
            inv.key(self.keys.completed(queue))
                .arg(self.now().timestamp())
                .arg(self.keys.task_prefix(queue))
                .arg(DELETE_COMPLETED_BATCH_SIZE);
            let deleted: usize = inv.invoke_async(&mut conn).await?;
            total += deleted;
            if deleted == 0 {
                return Ok(total);
            }
        }
    }

    async fn list_lease_expired(
        &self,
        cutoff: DateTime<Utc>,
        queues: &[String],
    ) -> Result<Vec<TaskMessage>> {
        let mut conn = self.conn.clone();
        let mut expired = Vec::new();
        for queue in queues {
            let mut inv = self.scripts.list_lease_expired.prepare_invoke();
            inv.key(self.keys.lease(queue))
                .arg(cutoff.timestamp())
                .arg(self.keys.task_prefix(queue));
            let raw: Vec<Vec<u8>> = inv.invoke_async(&mut conn).await?;
            for data in raw {
                expired.push(TaskMessage::decode(&data)?);
            }
        }
        Ok(expired)
    }

    async fn extend_lease(&self, queue: &str, ids: &[String]) -> Result<DateTime<Utc>> {
        let expire_at = self.now()
            + chrono::Duration::from_std(self.lease_duration)
                .map_err(|e| Error::Internal(e.to_string()))?;
        if ids.is_empty() {
            return Ok(expire_at);
        }
        let key = self.keys.lease(queue);
        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for id in ids {
            // XX: 既存メンバーのスコアだけ更新する
            pipe.cmd("ZADD")
                .arg(&key)
                .arg("XX")
                .arg(expire_at.timestamp())
                .arg(id)
                .ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(expire_at)
    }

    async fn write_server_state(
        &self,
        info: &ServerInfo,
        workers: &[WorkerInfo],
        ttl: Duration,
    ) -> Result<()> {
        let expire_at = self.now().timestamp() + ttl.as_secs() as i64;
        let server_key = self.keys.server_info(&info.host, info.pid, &info.server_id);
        let workers_key = self.keys.workers(&info.host, info.pid, &info.server_id);

        let mut conn = self.conn.clone();
        let _: i64 = conn
            .zadd(self.keys.all_servers(), &server_key, expire_at)
            .await?;
        let _: i64 = conn
            .zadd(self.keys.all_workers(), &workers_key, expire_at)
            .await?;

        let mut inv = self.scripts.write_server_state.prepare_invoke();
        inv.key(&server_key)
            .key(&workers_key)
            .arg(ttl.as_secs())
            .arg(presence::encode(info)?);
        for w in workers {
            inv.arg(&w.task_id).arg(presence::encode(w)?);
        }
        let _: () = inv.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn clear_server_state(&self, host: &str, pid: u32, server_id: &str) -> Result<()> {
        let server_key = self.keys.server_info(host, pid, server_id);
        let workers_key = self.keys.workers(host, pid, server_id);

        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(self.keys.all_servers(), &server_key).await?;
        let _: i64 = conn.zrem(self.keys.all_workers(), &workers_key).await?;

        let mut inv = self.scripts.clear_server_state.prepare_invoke();
        inv.key(&server_key).key(&workers_key);
        let _: () = inv.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn write_scheduler_entries(
        &self,
        scheduler_id: &str,
        entries: &[SchedulerEntry],
        ttl: Duration,
    ) -> Result<()> {
        let key = self.keys.scheduler_entries(scheduler_id);
        let expire_at = self.now().timestamp() + ttl.as_secs() as i64;

        let mut conn = self.conn.clone();
        let mut inv = self.scripts.write_scheduler_entries.prepare_invoke();
        inv.key(&key).arg(ttl.as_secs());
        for entry in entries {
            inv.arg(presence::encode(entry)?);
        }
        let _: () = inv.invoke_async(&mut conn).await?;
        let _: i64 = conn
            .zadd(self.keys.all_schedulers(), &key, expire_at)
            .await?;
        Ok(())
    }

    async fn clear_scheduler_entries(&self, scheduler_id: &str) -> Result<()> {
        let key = self.keys.scheduler_entries(scheduler_id);
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(self.keys.all_schedulers(), &key).await?;
        let _: i64 = conn.del(&key).await?;
        Ok(())
    }

    async fn record_scheduler_enqueue_event(
        &self,
        entry_id: &str,
        event: &SchedulerEnqueueEvent,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.record_scheduler_enqueue_event.prepare_invoke();
        inv.key(self.keys.scheduler_history(entry_id))
            .arg(event.enqueued_at.timestamp())
            .arg(presence::encode(event)?)
            .arg(MAX_SCHEDULER_EVENTS);
        let _: () = inv.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn clear_scheduler_history(&self, entry_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(self.keys.scheduler_history(entry_id)).await?;
        Ok(())
    }

    async fn write_result(&self, queue: &str, id: &str, data: &[u8]) -> Result<usize> {
        let mut conn = self.conn.clone();
        let mut inv = self.scripts.write_result.prepare_invoke();
        inv.key(self.keys.task(queue, id)).arg(data);
        let written: usize = inv
            .invoke_async(&mut conn)
            .await
            .map_err(|e| task_error(e, id))?;
        Ok(written)
    }

    async fn pause(&self, queue: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let set: bool = ::redis::cmd("SET")
            .arg(self.keys.paused(queue))
            .arg(self.now().timestamp())
            .arg("NX")
            .query_async::<_, Option<String>>(&mut conn)
            .await?
            .is_some();
        if !set {
            return Err(Error::Internal(format!("queue {queue} is already paused")));
        }
        Ok(())
    }

    async fn unpause(&self, queue: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let deleted: i64 = conn.del(self.keys.paused(queue)).await?;
        if deleted == 0 {
            return Err(Error::Internal(format!("queue {queue} is not paused")));
        }
        Ok(())
    }

    async fn all_queues(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut queues: Vec<String> = conn.smembers(self.keys.all_queues()).await?;
        queues.sort();
        Ok(queues)
    }

    async fn task_state(&self, queue: &str, id: &str) -> Result<Option<TaskState>> {
        let mut conn = self.conn.clone();
        let state: Option<String> = conn.hget(self.keys.task(queue, id), "state").await?;
        state.map(|s| s.parse()).transpose()
    }
}
