//! In-memory broker implementation.
//!
//! Redis 実装と同じ状態機械を 1 つのロックの下で再現する。
//! キー（リスト / ソート済み集合 / ハッシュ）ごとに同じ名前のフィールドを持ち、
//! 各メソッドは対応する Lua スクリプトと同じ手順で状態を書き換える。
//! ハッシュの TTL は読み出し時に遅延評価する。

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    ARCHIVED_EXPIRATION_DAYS, Broker, DELETE_COMPLETED_BATCH_SIZE, FORWARD_BATCH_SIZE,
    LEASE_DURATION, MAX_ARCHIVE_SIZE, MAX_SCHEDULER_EVENTS,
};
use crate::error::{Error, Result};
use crate::ports::{Clock, SystemClock};
use crate::presence::{self, SchedulerEnqueueEvent, SchedulerEntry, ServerInfo, WorkerInfo};
use crate::task::{TaskMessage, TaskState};

/// Sorted set: member -> score, iterated by (score, member).
#[derive(Debug, Default)]
struct ZSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl ZSet {
    fn add(&mut self, member: &str, score: i64) {
        if let Some(old) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    /// `ZADD XX`
    fn update_existing(&mut self, member: &str, score: i64) -> bool {
        if !self.scores.contains_key(member) {
            return false;
        }
        self.add(member, score);
        true
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(score, member.to_string()));
                true
            }
            None => false,
        }
    }

    fn contains(&self, member: &str) -> bool {
        self.scores.contains_key(member)
    }

    fn len(&self) -> usize {
        self.scores.len()
    }

    /// `ZRANGEBYSCORE key -inf max LIMIT 0 limit`
    fn range_to(&self, max: i64, limit: usize) -> Vec<String> {
        self.ordered
            .iter()
            .take_while(|(score, _)| *score <= max)
            .take(limit)
            .map(|(_, member)| member.clone())
            .collect()
    }

    /// `ZREMRANGEBYSCORE key -inf max`
    fn remove_to(&mut self, max: i64) {
        for member in self.range_to(max, usize::MAX) {
            self.remove(&member);
        }
    }

    /// `ZREMRANGEBYRANK key 0 -max`
    fn trim_ranks(&mut self, max: usize) {
        if self.len() < max {
            return;
        }
        let excess = self.len() - max + 1;
        let lowest: Vec<String> = self
            .ordered
            .iter()
            .take(excess)
            .map(|(_, member)| member.clone())
            .collect();
        for member in lowest {
            self.remove(&member);
        }
    }

    fn members(&self) -> impl Iterator<Item = &(i64, String)> {
        self.ordered.iter()
    }
}

#[derive(Debug)]
struct TaskHash {
    msg: TaskMessage,
    state: TaskState,
    pending_since: Option<i64>,
    unique_key: Option<String>,
    result: Option<Vec<u8>>,
    expires_at: Option<DateTime<Utc>>,
}

impl TaskHash {
    fn new(msg: TaskMessage, state: TaskState) -> Self {
        Self {
            msg,
            state,
            pending_since: None,
            unique_key: None,
            result: None,
            expires_at: None,
        }
    }

    fn expire_in(&mut self, ttl_secs: i64, now: DateTime<Utc>) {
        if ttl_secs > 0 {
            self.expires_at = Some(now + chrono::Duration::seconds(ttl_secs));
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    /// front = next to be dequeued (the RPOP end)
    pending: VecDeque<String>,
    active: Vec<String>,
    scheduled: ZSet,
    retry: ZSet,
    archived: ZSet,
    completed: ZSet,
    lease: ZSet,
    paused: bool,
    tasks: HashMap<String, TaskHash>,
    processed_total: i64,
    failed_total: i64,
    processed_daily: BTreeMap<String, i64>,
    failed_daily: BTreeMap<String, i64>,
}

impl QueueState {
    /// Task hash, honouring its TTL.
    fn task_mut(&mut self, id: &str, now: DateTime<Utc>) -> Option<&mut TaskHash> {
        let expired = self
            .tasks
            .get(id)
            .and_then(|t| t.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.tasks.remove(id);
        }
        self.tasks.get_mut(id)
    }

    fn task_exists(&mut self, id: &str, now: DateTime<Utc>) -> bool {
        self.task_mut(id, now).is_some()
    }

    fn remove_active(&mut self, id: &str) -> bool {
        let before = self.active.len();
        self.active.retain(|a| a != id);
        before != self.active.len()
    }

    fn bump_processed(&mut self, now: DateTime<Utc>) {
        *self.processed_daily.entry(day(now)).or_default() += 1;
        bump(&mut self.processed_total);
    }

    fn bump_failed(&mut self, now: DateTime<Utc>) {
        *self.processed_daily.entry(day(now)).or_default() += 1;
        *self.failed_daily.entry(day(now)).or_default() += 1;
        if self.processed_total == i64::MAX {
            self.processed_total = 1;
            self.failed_total = 1;
        } else {
            self.processed_total += 1;
            self.failed_total += 1;
        }
    }
}

fn day(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// INCR that wraps to 1 instead of overflowing.
fn bump(counter: &mut i64) {
    if *counter == i64::MAX {
        *counter = 1;
    } else {
        *counter += 1;
    }
}

#[derive(Debug)]
struct Expiring<T> {
    value: T,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    queues: HashMap<String, QueueState>,
    all_queues: BTreeSet<String>,
    unique: HashMap<String, Expiring<String>>,
    servers: HashMap<String, Expiring<(ServerInfo, Vec<WorkerInfo>)>>,
    schedulers: HashMap<String, Expiring<Vec<SchedulerEntry>>>,
    scheduler_history: HashMap<String, ZSet>,
}

impl InMemoryState {
    fn queue(&mut self, name: &str) -> &mut QueueState {
        self.queues.entry(name.to_string()).or_default()
    }

    /// `SET key id NX EX ttl`
    fn acquire_unique(&mut self, key: &str, id: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        if let Some(lock) = self.unique.get(key)
            && lock.expires_at > now
        {
            return false;
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        self.unique.insert(
            key.to_string(),
            Expiring {
                value: id.to_string(),
                expires_at: now + ttl,
            },
        );
        true
    }

    /// Release the lock only if it still points at `id`.
    fn release_unique(&mut self, key: &str, id: &str, now: DateTime<Utc>) {
        if let Some(lock) = self.unique.get(key)
            && lock.expires_at > now
            && lock.value == id
        {
            self.unique.remove(key);
        }
    }
}

/// Sizes of every per-queue set plus the cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounters {
    pub pending: usize,
    pub active: usize,
    pub scheduled: usize,
    pub retry: usize,
    pub archived: usize,
    pub completed: usize,
    pub lease: usize,
    pub processed_total: i64,
    pub failed_total: i64,
}

/// In-memory broker.
///
/// clone したハンドルは同じ状態を共有する。
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<Mutex<InMemoryState>>,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState::default())),
            clock,
            lease_duration: LEASE_DURATION,
        }
    }

    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    pub async fn counters(&self, queue: &str) -> QueueCounters {
        let state = self.state.lock().await;
        let Some(q) = state.queues.get(queue) else {
            return QueueCounters::default();
        };
        QueueCounters {
            pending: q.pending.len(),
            active: q.active.len(),
            scheduled: q.scheduled.len(),
            retry: q.retry.len(),
            archived: q.archived.len(),
            completed: q.completed.len(),
            lease: q.lease.len(),
            processed_total: q.processed_total,
            failed_total: q.failed_total,
        }
    }

    /// Stored message of a task, if its hash exists.
    pub async fn message(&self, queue: &str, id: &str) -> Option<TaskMessage> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state
            .queue(queue)
            .task_mut(id, now)
            .map(|t| t.msg.clone())
    }

    pub async fn result(&self, queue: &str, id: &str) -> Option<Vec<u8>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state
            .queue(queue)
            .task_mut(id, now)
            .and_then(|t| t.result.clone())
    }

    pub async fn lease_expiration(&self, queue: &str, id: &str) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        let score = *state.queues.get(queue)?.lease.scores.get(id)?;
        DateTime::from_timestamp(score, 0)
    }

    /// Live server records.
    pub async fn servers(&self) -> Vec<(ServerInfo, Vec<WorkerInfo>)> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .servers
            .values()
            .filter(|s| s.expires_at > now)
            .map(|s| s.value.clone())
            .collect()
    }

    pub async fn scheduler_entries(&self, scheduler_id: &str) -> Vec<SchedulerEntry> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        state
            .schedulers
            .get(scheduler_id)
            .filter(|s| s.expires_at > now)
            .map(|s| s.value.clone())
            .unwrap_or_default()
    }

    pub async fn scheduler_history(&self, entry_id: &str) -> Result<Vec<SchedulerEnqueueEvent>> {
        let state = self.state.lock().await;
        let Some(events) = state.scheduler_history.get(entry_id) else {
            return Ok(Vec::new());
        };
        events
            .members()
            .map(|(_, raw)| presence::decode(raw.as_bytes()))
            .collect()
    }

    fn lease_expiration_from(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Ok(now
            + chrono::Duration::from_std(self.lease_duration)
                .map_err(|e| Error::Internal(e.to_string()))?)
    }

    fn server_key(host: &str, pid: u32, server_id: &str) -> String {
        format!("{host}:{pid}:{server_id}")
    }

    async fn insert_pending(
        &self,
        msg: &TaskMessage,
        unique: Option<(&str, Duration)>,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.all_queues.insert(msg.queue.clone());

        if let Some((key, ttl)) = unique
            && !state.acquire_unique(key, &msg.id, ttl, now)
        {
            return Err(Error::DuplicateTask(key.to_string()));
        }
        let q = state.queue(&msg.queue);
        if q.task_exists(&msg.id, now) {
            return Err(Error::TaskIdConflict);
        }
        let mut hash = TaskHash::new(msg.clone(), TaskState::Pending);
        hash.pending_since = now.timestamp_nanos_opt();
        hash.unique_key = unique.map(|(key, _)| key.to_string());
        hash.expire_in(msg.hash_ttl_secs(now), now);
        q.tasks.insert(msg.id.clone(), hash);
        q.pending.push_back(msg.id.clone());
        Ok(())
    }

    async fn insert_scheduled(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        unique: Option<(&str, Duration)>,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.all_queues.insert(msg.queue.clone());

        if let Some((key, ttl)) = unique
            && !state.acquire_unique(key, &msg.id, ttl, now)
        {
            return Err(Error::DuplicateTask(key.to_string()));
        }
        let q = state.queue(&msg.queue);
        if q.task_exists(&msg.id, now) {
            return Err(Error::TaskIdConflict);
        }
        let mut hash = TaskHash::new(msg.clone(), TaskState::Scheduled);
        hash.unique_key = unique.map(|(key, _)| key.to_string());
        q.tasks.insert(msg.id.clone(), hash);
        q.scheduled.add(&msg.id, process_at.timestamp());
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn enqueue(&self, msg: &TaskMessage) -> Result<()> {
        self.insert_pending(msg, None).await
    }

    async fn enqueue_unique(&self, msg: &TaskMessage, ttl: Duration) -> Result<()> {
        self.insert_pending(msg, Some((&msg.unique_key, ttl))).await
    }

    async fn dequeue(&self, queues: &[String]) -> Result<(TaskMessage, DateTime<Utc>)> {
        let now = self.clock.now();
        let lease_expires_at = self.lease_expiration_from(now)?;
        let mut state = self.state.lock().await;

        for name in queues {
            let q = state.queue(name);
            if q.paused {
                continue;
            }
            while let Some(id) = q.pending.pop_front() {
                q.active.push(id.clone());
                let Some(hash) = q.task_mut(&id, now) else {
                    // ハッシュが期限切れ: ID だけ捨てて次へ
                    q.remove_active(&id);
                    continue;
                };
                hash.expires_at = None;
                hash.state = TaskState::Active;
                hash.pending_since = None;
                let msg = hash.msg.clone();
                q.lease.add(&id, lease_expires_at.timestamp());
                return Ok((msg, lease_expires_at));
            }
        }
        Err(Error::NoProcessableTask)
    }

    async fn done(&self, msg: &TaskMessage) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let q = state.queue(&msg.queue);
        if !q.remove_active(&msg.id) || !q.lease.remove(&msg.id) {
            return Err(Error::TaskNotFound(msg.id.clone()));
        }
        if !q.task_exists(&msg.id, now) {
            return Err(Error::TaskNotFound(msg.id.clone()));
        }
        q.tasks.remove(&msg.id);
        q.bump_processed(now);
        if msg.has_unique_key() {
            state.release_unique(&msg.unique_key, &msg.id, now);
        }
        Ok(())
    }

    async fn mark_as_complete(&self, msg: &TaskMessage) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let q = state.queue(&msg.queue);
        if !q.remove_active(&msg.id) || !q.lease.remove(&msg.id) {
            return Err(Error::TaskNotFound(msg.id.clone()));
        }
        q.completed.add(&msg.id, now.timestamp() + msg.retention);
        let mut completed = msg.clone();
        completed.completed_at = now.timestamp();
        match q.task_mut(&msg.id, now) {
            Some(hash) => {
                hash.msg = completed;
                hash.state = TaskState::Completed;
            }
            None => {
                q.tasks
                    .insert(msg.id.clone(), TaskHash::new(completed, TaskState::Completed));
            }
        }
        q.bump_processed(now);
        if msg.has_unique_key() {
            state.release_unique(&msg.unique_key, &msg.id, now);
        }
        Ok(())
    }

    async fn requeue(&self, msg: &TaskMessage) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let q = state.queue(&msg.queue);
        if !q.remove_active(&msg.id) || !q.lease.remove(&msg.id) {
            return Err(Error::TaskNotFound(msg.id.clone()));
        }
        q.pending.push_front(msg.id.clone());
        if let Some(hash) = q.task_mut(&msg.id, now) {
            hash.state = TaskState::Pending;
        }
        Ok(())
    }

    async fn schedule(&self, msg: &TaskMessage, process_at: DateTime<Utc>) -> Result<()> {
        self.insert_scheduled(msg, process_at, None).await
    }

    async fn schedule_unique(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<()> {
        self.insert_scheduled(msg, process_at, Some((&msg.unique_key, ttl)))
            .await
    }

    async fn retry(
        &self,
        msg: &TaskMessage,
        process_at: DateTime<Utc>,
        err_msg: &str,
        is_failure: bool,
    ) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let q = state.queue(&msg.queue);
        if !q.remove_active(&msg.id) || !q.lease.remove(&msg.id) {
            return Err(Error::TaskNotFound(msg.id.clone()));
        }
        q.retry.add(&msg.id, process_at.timestamp());

        let mut modified = msg.clone();
        if is_failure {
            modified.retried += 1;
        }
        modified.error_msg = err_msg.to_string();
        modified.last_failed_at = now.timestamp();
        match q.task_mut(&msg.id, now) {
            Some(hash) => {
                hash.msg = modified;
                hash.state = TaskState::Retry;
            }
            None => {
                q.tasks
                    .insert(msg.id.clone(), TaskHash::new(modified, TaskState::Retry));
            }
        }
        if is_failure {
            q.bump_failed(now);
        }
        Ok(())
    }

    async fn archive(&self, msg: &TaskMessage, _err_msg: &str) -> Result<()> {
        let now = self.clock.now();
        let cutoff = now - chrono::Duration::days(ARCHIVED_EXPIRATION_DAYS);
        let mut state = self.state.lock().await;
        let q = state.queue(&msg.queue);
        if !q.remove_active(&msg.id) || !q.lease.remove(&msg.id) {
            return Err(Error::TaskNotFound(msg.id.clone()));
        }
        q.archived.add(&msg.id, now.timestamp());
        q.archived.remove_to(cutoff.timestamp());
        q.archived.trim_ranks(MAX_ARCHIVE_SIZE as usize);
        q.tasks.remove(&msg.id);
        q.bump_failed(now);
        Ok(())
    }

    async fn forward_if_ready(&self, queues: &[String]) -> Result<usize> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut total = 0;
        for name in queues {
            let q = state.queue(name);
            for from_retry in [false, true] {
                loop {
                    let source = if from_retry { &mut q.retry } else { &mut q.scheduled };
                    let ids = source.range_to(now.timestamp(), FORWARD_BATCH_SIZE);
                    if ids.is_empty() {
                        break;
                    }
                    for id in ids {
                        let source = if from_retry { &mut q.retry } else { &mut q.scheduled };
                        source.remove(&id);
                        q.pending.push_back(id.clone());
                        if let Some(hash) = q.task_mut(&id, now) {
                            hash.state = TaskState::Pending;
                            hash.pending_since = now.timestamp_nanos_opt();
                        }
                        total += 1;
                    }
                }
            }
        }
        Ok(total)
    }

    async fn delete_expired_completed_tasks(&self, queue: &str) -> Result<usize> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let q = state.queue(queue);
        let mut total = 0;
        loop {
            let ids = q
                .completed
                .range_to(now.timestamp(), DELETE_COMPLETED_BATCH_SIZE);
            if ids.is_empty() {
                return Ok(total);
            }
            for id in ids {
                q.tasks.remove(&id);
                q.completed.remove(&id);
                total += 1;
            }
        }
    }

    async fn list_lease_expired(
        &self,
        cutoff: DateTime<Utc>,
        queues: &[String],
    ) -> Result<Vec<TaskMessage>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut expired = Vec::new();
        for name in queues {
            let q = state.queue(name);
            for id in q.lease.range_to(cutoff.timestamp(), usize::MAX) {
                if let Some(hash) = q.task_mut(&id, now) {
                    expired.push(hash.msg.clone());
                }
            }
        }
        Ok(expired)
    }

    async fn extend_lease(&self, queue: &str, ids: &[String]) -> Result<DateTime<Utc>> {
        let expire_at = self.lease_expiration_from(self.clock.now())?;
        let mut state = self.state.lock().await;
        let q = state.queue(queue);
        for id in ids {
            q.lease.update_existing(id, expire_at.timestamp());
        }
        Ok(expire_at)
    }

    async fn write_server_state(
        &self,
        info: &ServerInfo,
        workers: &[WorkerInfo],
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = self.clock.now()
            + chrono::Duration::from_std(ttl).map_err(|e| Error::Internal(e.to_string()))?;
        let mut state = self.state.lock().await;
        state.servers.insert(
            Self::server_key(&info.host, info.pid, &info.server_id),
            Expiring {
                value: (info.clone(), workers.to_vec()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn clear_server_state(&self, host: &str, pid: u32, server_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.servers.remove(&Self::server_key(host, pid, server_id));
        Ok(())
    }

    async fn write_scheduler_entries(
        &self,
        scheduler_id: &str,
        entries: &[SchedulerEntry],
        ttl: Duration,
    ) -> Result<()> {
        let expires_at = self.clock.now()
            + chrono::Duration::from_std(ttl).map_err(|e| Error::Internal(e.to_string()))?;
        let mut state = self.state.lock().await;
        state.schedulers.insert(
            scheduler_id.to_string(),
            Expiring {
                value: entries.to_vec(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn clear_scheduler_entries(&self, scheduler_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.schedulers.remove(scheduler_id);
        Ok(())
    }

    async fn record_scheduler_enqueue_event(
        &self,
        entry_id: &str,
        event: &SchedulerEnqueueEvent,
    ) -> Result<()> {
        let encoded = presence::encode(event)?;
        let mut state = self.state.lock().await;
        let history = state
            .scheduler_history
            .entry(entry_id.to_string())
            .or_default();
        history.trim_ranks(MAX_SCHEDULER_EVENTS);
        history.add(&encoded, event.enqueued_at.timestamp());
        Ok(())
    }

    async fn clear_scheduler_history(&self, entry_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.scheduler_history.remove(entry_id);
        Ok(())
    }

    async fn write_result(&self, queue: &str, id: &str, data: &[u8]) -> Result<usize> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let hash = state
            .queue(queue)
            .task_mut(id, now)
            .ok_or_else(|| Error::TaskNotFound(id.to_string()))?;
        hash.result = Some(data.to_vec());
        Ok(data.len())
    }

    async fn pause(&self, queue: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let q = state.queue(queue);
        if q.paused {
            return Err(Error::Internal(format!("queue {queue} is already paused")));
        }
        q.paused = true;
        Ok(())
    }

    async fn unpause(&self, queue: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let q = state.queue(queue);
        if !q.paused {
            return Err(Error::Internal(format!("queue {queue} is not paused")));
        }
        q.paused = false;
        Ok(())
    }

    async fn all_queues(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        Ok(state.all_queues.iter().cloned().collect())
    }

    async fn task_state(&self, queue: &str, id: &str) -> Result<Option<TaskState>> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.queue(queue).task_mut(id, now).map(|t| t.state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeySpace;
    use crate::ports::FixedClock;
    use crate::presence::ServerStatus;
    use chrono::TimeZone;
    use rstest::rstest;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn setup() -> (InMemoryBroker, FixedClock) {
        let clock = FixedClock::new(t0());
        (InMemoryBroker::with_clock(Arc::new(clock.clone())), clock)
    }

    fn msg(id: &str) -> TaskMessage {
        let mut m = TaskMessage::new("x", b"payload".to_vec(), id, "default");
        m.retry = 2;
        m.timeout = 60;
        m
    }

    fn queues(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    /// Which sets currently hold `id`.
    async fn homes(broker: &InMemoryBroker, queue: &str, id: &str) -> Vec<&'static str> {
        let state = broker.state.lock().await;
        let Some(q) = state.queues.get(queue) else {
            return Vec::new();
        };
        let mut homes = Vec::new();
        if q.pending.iter().any(|p| p == id) {
            homes.push("pending");
        }
        if q.active.iter().any(|a| a == id) {
            homes.push("active");
        }
        for (name, set) in [
            ("scheduled", &q.scheduled),
            ("retry", &q.retry),
            ("archived", &q.archived),
            ("completed", &q.completed),
        ] {
            if set.contains(id) {
                homes.push(name);
            }
        }
        homes
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_is_fifo() {
        let (broker, _) = setup();
        for id in ["a", "b", "c"] {
            broker.enqueue(&msg(id)).await.unwrap();
        }

        let q = queues(&["default"]);
        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(broker.dequeue(&q).await.unwrap().0.id);
        }
        assert_eq!(got, ["a", "b", "c"]);
        assert!(matches!(broker.dequeue(&q).await, Err(Error::NoProcessableTask)));
    }

    #[tokio::test]
    async fn duplicate_id_is_a_conflict() {
        let (broker, _) = setup();
        broker.enqueue(&msg("a")).await.unwrap();
        let err = broker.enqueue(&msg("a")).await.unwrap_err();
        assert!(matches!(err, Error::TaskIdConflict));
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn dequeue_grants_a_lease_and_persists_the_hash() {
        let (broker, clock) = setup();
        broker.enqueue(&msg("a")).await.unwrap();

        let (got, lease) = broker.dequeue(&queues(&["default"])).await.unwrap();
        assert_eq!(got.id, "a");
        assert_eq!(lease, t0() + chrono::Duration::minutes(30));
        assert_eq!(broker.lease_expiration("default", "a").await, Some(lease));

        // 60 秒の TTL を過ぎても active なタスクのハッシュは残る
        clock.advance(chrono::Duration::minutes(5));
        assert_eq!(
            broker.task_state("default", "a").await.unwrap(),
            Some(TaskState::Active)
        );
    }

    #[tokio::test]
    async fn expired_pending_hashes_are_skipped() {
        let (broker, clock) = setup();
        broker.enqueue(&msg("stale")).await.unwrap();
        clock.advance(chrono::Duration::seconds(61));
        broker.enqueue(&msg("fresh")).await.unwrap();

        let (got, _) = broker.dequeue(&queues(&["default"])).await.unwrap();
        assert_eq!(got.id, "fresh");
        assert_eq!(broker.counters("default").await.active, 1);
    }

    #[tokio::test]
    async fn concurrent_dequeues_claim_each_task_once() {
        let (broker, _) = setup();
        for i in 0..20 {
            broker.enqueue(&msg(&format!("t{i}"))).await.unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = broker.clone();
                tokio::spawn(async move {
                    let mut claimed = Vec::new();
                    while let Ok((m, _)) = b.dequeue(&queues(&["default"])).await {
                        claimed.push(m.id);
                    }
                    claimed
                })
            })
            .collect();

        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.unwrap());
        }
        let unique: BTreeSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test]
    async fn paused_queue_is_skipped_not_blocked_on() {
        let (broker, _) = setup();
        let mut low = msg("low-1");
        low.queue = "low".into();
        broker.enqueue(&msg("a")).await.unwrap();
        broker.enqueue(&low).await.unwrap();

        broker.pause("default").await.unwrap();
        assert!(broker.pause("default").await.is_err());

        let (got, _) = broker.dequeue(&queues(&["default", "low"])).await.unwrap();
        assert_eq!(got.id, "low-1");
        assert!(matches!(
            broker.dequeue(&queues(&["default"])).await,
            Err(Error::NoProcessableTask)
        ));

        broker.unpause("default").await.unwrap();
        assert_eq!(broker.dequeue(&queues(&["default"])).await.unwrap().0.id, "a");
    }

    #[tokio::test]
    async fn every_task_has_exactly_one_home() {
        let (broker, clock) = setup();
        let q = queues(&["default"]);
        for id in ["done", "complete", "retry", "archive", "requeue"] {
            broker.enqueue(&msg(id)).await.unwrap();
        }
        broker
            .schedule(&msg("later"), t0() + chrono::Duration::hours(1))
            .await
            .unwrap();

        let mut active = HashMap::new();
        for _ in 0..5 {
            let (m, _) = broker.dequeue(&q).await.unwrap();
            assert_eq!(homes(&broker, "default", &m.id).await, ["active"]);
            active.insert(m.id.clone(), m);
        }

        broker.done(&active["done"]).await.unwrap();
        let mut complete = active["complete"].clone();
        complete.retention = 60;
        broker.mark_as_complete(&complete).await.unwrap();
        broker
            .retry(&active["retry"], clock.now(), "boom", true)
            .await
            .unwrap();
        broker.archive(&active["archive"], "boom").await.unwrap();
        broker.requeue(&active["requeue"]).await.unwrap();

        assert!(homes(&broker, "default", "done").await.is_empty());
        assert_eq!(homes(&broker, "default", "complete").await, ["completed"]);
        assert_eq!(homes(&broker, "default", "retry").await, ["retry"]);
        assert_eq!(homes(&broker, "default", "archive").await, ["archived"]);
        assert_eq!(homes(&broker, "default", "requeue").await, ["pending"]);
        assert_eq!(homes(&broker, "default", "later").await, ["scheduled"]);

        let counters = broker.counters("default").await;
        assert_eq!(counters.active, 0);
        assert_eq!(counters.lease, 0);
        assert_eq!(counters.processed_total, 4);
        assert_eq!(counters.failed_total, 2);
    }

    #[tokio::test]
    async fn requeued_task_is_dequeued_next() {
        let (broker, _) = setup();
        let q = queues(&["default"]);
        broker.enqueue(&msg("a")).await.unwrap();
        broker.enqueue(&msg("b")).await.unwrap();

        let (a, _) = broker.dequeue(&q).await.unwrap();
        broker.requeue(&a).await.unwrap();
        assert_eq!(
            broker.task_state("default", "a").await.unwrap(),
            Some(TaskState::Pending)
        );
        assert_eq!(broker.dequeue(&q).await.unwrap().0.id, "a");
    }

    #[rstest]
    #[case::done("done")]
    #[case::complete("complete")]
    #[case::requeue("requeue")]
    #[case::retry("retry")]
    #[case::archive("archive")]
    #[tokio::test]
    async fn transitions_from_active_require_an_active_task(#[case] op: &str) {
        let (broker, clock) = setup();
        broker.enqueue(&msg("a")).await.unwrap();
        let m = msg("a");

        let res = match op {
            "done" => {
                let mut missing = m.clone();
                missing.id = "missing".into();
                broker.done(&missing).await
            }
            "complete" => broker.mark_as_complete(&m).await,
            "requeue" => broker.requeue(&m).await,
            "archive" => broker.archive(&m, "e").await,
            _ => broker.retry(&m, clock.now(), "e", true).await,
        };
        assert!(matches!(res, Err(Error::TaskNotFound(_))));
        assert_eq!(homes(&broker, "default", "a").await, ["pending"]);
    }

    #[rstest]
    #[case::pending("pending")]
    #[case::scheduled("scheduled")]
    #[case::retry("retry")]
    #[tokio::test]
    async fn done_and_archive_leave_inactive_tasks_in_their_home(#[case] home: &'static str) {
        let (broker, clock) = setup();
        let q = queues(&["default"]);
        let m = msg("t1");
        match home {
            "pending" => broker.enqueue(&m).await.unwrap(),
            "scheduled" => broker
                .schedule(&m, clock.now() + chrono::Duration::minutes(5))
                .await
                .unwrap(),
            _ => {
                broker.enqueue(&m).await.unwrap();
                let (got, _) = broker.dequeue(&q).await.unwrap();
                broker
                    .retry(&got, clock.now() + chrono::Duration::minutes(5), "e", true)
                    .await
                    .unwrap();
            }
        }

        assert!(matches!(broker.done(&m).await, Err(Error::TaskNotFound(_))));
        assert!(matches!(broker.archive(&m, "e").await, Err(Error::TaskNotFound(_))));
        assert_eq!(homes(&broker, "default", "t1").await, [home]);
        assert!(broker.message("default", "t1").await.is_some());
        assert_eq!(broker.counters("default").await.archived, 0);
    }

    #[tokio::test]
    async fn retried_counts_only_failures() {
        let (broker, clock) = setup();
        let q = queues(&["default"]);
        broker.enqueue(&msg("a")).await.unwrap();

        let mut last = 0;
        for is_failure in [true, false, true, false] {
            let (m, _) = broker.dequeue(&q).await.unwrap();
            assert!(m.retried >= last);
            last = m.retried;
            broker.retry(&m, clock.now(), "err", is_failure).await.unwrap();
            broker.forward_if_ready(&q).await.unwrap();
        }

        let stored = broker.message("default", "a").await.unwrap();
        assert_eq!(stored.retried, 2);
        assert_eq!(stored.error_msg, "err");
        assert_eq!(stored.last_failed_at, t0().timestamp());
        assert_eq!(broker.counters("default").await.failed_total, 2);
    }

    #[tokio::test]
    async fn extend_lease_never_creates_entries() {
        let (broker, clock) = setup();
        broker.enqueue(&msg("a")).await.unwrap();
        broker.dequeue(&queues(&["default"])).await.unwrap();

        clock.advance(chrono::Duration::minutes(10));
        let expire_at = broker
            .extend_lease("default", &queues(&["a", "ghost"]))
            .await
            .unwrap();

        assert_eq!(expire_at, clock.now() + chrono::Duration::minutes(30));
        assert_eq!(broker.lease_expiration("default", "a").await, Some(expire_at));
        assert_eq!(broker.lease_expiration("default", "ghost").await, None);
        assert_eq!(broker.counters("default").await.lease, 1);
    }

    #[tokio::test]
    async fn unique_lock_holds_until_ttl_elapses() {
        let (broker, clock) = setup();
        let keys = KeySpace::default();
        let unique = |id: &str| {
            let mut m = msg(id);
            m.unique_key = keys.unique("default", "x", b"payload");
            m
        };
        let ttl = Duration::from_secs(30);

        broker.enqueue_unique(&unique("a"), ttl).await.unwrap();
        let err = broker.enqueue_unique(&unique("b"), ttl).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateTask(_)));

        clock.advance(chrono::Duration::seconds(31));
        broker.enqueue_unique(&unique("c"), ttl).await.unwrap();
    }

    #[tokio::test]
    async fn done_releases_its_own_unique_lock() {
        let (broker, _) = setup();
        let mut m = msg("a");
        m.unique_key = KeySpace::default().unique("default", "x", b"payload");
        let ttl = Duration::from_secs(3600);

        broker.enqueue_unique(&m, ttl).await.unwrap();
        let (got, _) = broker.dequeue(&queues(&["default"])).await.unwrap();
        broker.done(&got).await.unwrap();

        let mut again = m.clone();
        again.id = "b".into();
        broker.enqueue_unique(&again, ttl).await.unwrap();
    }

    #[tokio::test]
    async fn archive_is_bounded_by_count() {
        let (broker, clock) = setup();
        let q = queues(&["default"]);
        let total = MAX_ARCHIVE_SIZE as usize + 5;
        for i in 0..total {
            let mut m = msg(&format!("t{i}"));
            m.timeout = 0;
            broker.enqueue(&m).await.unwrap();
        }
        for _ in 0..total {
            let (m, _) = broker.dequeue(&q).await.unwrap();
            broker.archive(&m, "dead").await.unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }

        let counters = broker.counters("default").await;
        assert!(counters.archived <= MAX_ARCHIVE_SIZE as usize);
        // 古いものから落ちる
        assert_eq!(homes(&broker, "default", "t0").await, Vec::<&str>::new());
        assert_eq!(homes(&broker, "default", &format!("t{}", total - 1)).await, ["archived"]);
    }

    #[tokio::test]
    async fn archive_drops_entries_older_than_the_cutoff() {
        let (broker, clock) = setup();
        let q = queues(&["default"]);
        broker.enqueue(&msg("old")).await.unwrap();
        broker.enqueue(&msg("new")).await.unwrap();
        let (old, _) = broker.dequeue(&q).await.unwrap();
        let (new, _) = broker.dequeue(&q).await.unwrap();

        broker.archive(&old, "dead").await.unwrap();
        clock.advance(chrono::Duration::days(ARCHIVED_EXPIRATION_DAYS + 1));
        broker.archive(&new, "dead").await.unwrap();

        assert!(homes(&broker, "default", "old").await.is_empty());
        assert_eq!(homes(&broker, "default", "new").await, ["archived"]);
        assert_eq!(broker.task_state("default", "new").await.unwrap(), None);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_leads_to_archive() {
        let (broker, clock) = setup();
        let q = queues(&["default"]);
        broker.enqueue(&msg("T1")).await.unwrap();

        let (mut m, lease) = broker.dequeue(&q).await.unwrap();
        assert_eq!(lease, clock.now() + chrono::Duration::minutes(30));

        for _ in 0..2 {
            assert!(m.retried < m.retry);
            broker.retry(&m, clock.now(), "boom", true).await.unwrap();
            broker.forward_if_ready(&q).await.unwrap();
            m = broker.dequeue(&q).await.unwrap().0;
        }

        assert_eq!(m.retried, 2);
        assert!(m.retried >= m.retry);
        broker.archive(&m, "boom").await.unwrap();
        assert_eq!(homes(&broker, "default", "T1").await, ["archived"]);
    }

    #[tokio::test]
    async fn scheduled_task_is_forwarded_once_due() {
        let (broker, clock) = setup();
        let q = queues(&["default"]);
        broker
            .schedule(&msg("T2"), clock.now() + chrono::Duration::seconds(5))
            .await
            .unwrap();

        assert_eq!(broker.forward_if_ready(&q).await.unwrap(), 0);
        clock.advance(chrono::Duration::seconds(5));
        assert_eq!(broker.forward_if_ready(&q).await.unwrap(), 1);
        assert_eq!(
            broker.task_state("default", "T2").await.unwrap(),
            Some(TaskState::Pending)
        );
        assert_eq!(broker.dequeue(&q).await.unwrap().0.id, "T2");
    }

    #[tokio::test]
    async fn forward_drains_more_than_one_batch() {
        let (broker, clock) = setup();
        let q = queues(&["default"]);
        for i in 0..(FORWARD_BATCH_SIZE * 2 + 3) {
            broker
                .schedule(&msg(&format!("t{i}")), clock.now())
                .await
                .unwrap();
        }
        assert_eq!(
            broker.forward_if_ready(&q).await.unwrap(),
            FORWARD_BATCH_SIZE * 2 + 3
        );
    }

    #[tokio::test]
    async fn completed_task_survives_its_retention() {
        let (broker, clock) = setup();
        let q = queues(&["default"]);
        let mut t3 = msg("T3");
        t3.retention = 60;
        broker.enqueue(&t3).await.unwrap();
        let (m, _) = broker.dequeue(&q).await.unwrap();
        broker.mark_as_complete(&m).await.unwrap();

        assert_eq!(broker.delete_expired_completed_tasks("default").await.unwrap(), 0);
        let stored = broker.message("default", "T3").await.unwrap();
        assert_eq!(stored.completed_at, t0().timestamp());

        clock.advance(chrono::Duration::seconds(60));
        assert_eq!(broker.delete_expired_completed_tasks("default").await.unwrap(), 1);
        assert!(broker.message("default", "T3").await.is_none());
    }

    #[tokio::test]
    async fn lease_expired_listing_skips_missing_hashes() {
        let (broker, clock) = setup();
        let q = queues(&["default"]);
        broker.enqueue(&msg("a")).await.unwrap();
        broker.enqueue(&msg("b")).await.unwrap();
        broker.dequeue(&q).await.unwrap();
        broker.dequeue(&q).await.unwrap();
        broker.state.lock().await.queue("default").tasks.remove("b");

        clock.advance(chrono::Duration::minutes(31));
        let expired = broker.list_lease_expired(clock.now(), &q).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, "a");

        let early = broker
            .list_lease_expired(t0(), &q)
            .await
            .unwrap();
        assert!(early.is_empty());
    }

    #[tokio::test]
    async fn write_result_needs_an_existing_task() {
        let (broker, _) = setup();
        broker.enqueue(&msg("a")).await.unwrap();

        assert_eq!(broker.write_result("default", "a", b"ok").await.unwrap(), 2);
        assert_eq!(broker.result("default", "a").await.unwrap(), b"ok");
        assert!(matches!(
            broker.write_result("default", "ghost", b"ok").await,
            Err(Error::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn server_state_expires_with_its_ttl() {
        let (broker, clock) = setup();
        let info = ServerInfo {
            host: "h".into(),
            pid: 1,
            server_id: "s".into(),
            concurrency: 2,
            queues: BTreeMap::from([("default".into(), 1)]),
            strict_priority: false,
            status: ServerStatus::Active,
            started: t0(),
            active_worker_count: 0,
        };
        broker
            .write_server_state(&info, &[], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(broker.servers().await.len(), 1);

        clock.advance(chrono::Duration::seconds(6));
        assert!(broker.servers().await.is_empty());

        broker
            .write_server_state(&info, &[], Duration::from_secs(5))
            .await
            .unwrap();
        broker.clear_server_state("h", 1, "s").await.unwrap();
        assert!(broker.servers().await.is_empty());
    }

    #[tokio::test]
    async fn scheduler_history_is_capped() {
        let (broker, _) = setup();
        for i in 0..(MAX_SCHEDULER_EVENTS + 10) {
            let event = SchedulerEnqueueEvent {
                task_id: format!("t{i}"),
                enqueued_at: t0() + chrono::Duration::seconds(i as i64),
            };
            broker.record_scheduler_enqueue_event("e1", &event).await.unwrap();
        }
        let history = broker.scheduler_history("e1").await.unwrap();
        assert_eq!(history.len(), MAX_SCHEDULER_EVENTS);
        assert_eq!(history.last().unwrap().task_id, format!("t{}", MAX_SCHEDULER_EVENTS + 9));

        broker.clear_scheduler_history("e1").await.unwrap();
        assert!(broker.scheduler_history("e1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_registers_the_queue() {
        let (broker, clock) = setup();
        let mut critical = msg("c");
        critical.queue = "critical".into();
        broker.enqueue(&critical).await.unwrap();
        broker.schedule(&msg("d"), clock.now()).await.unwrap();

        assert_eq!(broker.all_queues().await.unwrap(), ["critical", "default"]);
    }

    #[rstest]
    #[case::below_cap(3, 5, 3)]
    #[case::at_cap(5, 5, 4)]
    #[case::above_cap(8, 5, 4)]
    fn trim_ranks_matches_zremrangebyrank(
        #[case] len: usize,
        #[case] max: usize,
        #[case] want: usize,
    ) {
        let mut set = ZSet::default();
        for i in 0..len {
            set.add(&format!("m{i}"), i as i64);
        }
        set.trim_ranks(max);
        assert_eq!(set.len(), want);
    }

    #[test]
    fn counters_wrap_instead_of_overflowing() {
        let mut c = i64::MAX;
        bump(&mut c);
        assert_eq!(c, 1);
    }
}
