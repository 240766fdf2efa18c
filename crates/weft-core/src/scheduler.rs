//! Scheduler - cron で定期的に enqueue する
//!
//! # 構成
//! - dispatch loop: 期限が来た entry を `Client::enqueue` し、`SchedulerEnqueueEvent` を記録
//! - heartbeat: 登録中の entry 一覧を TTL 付きで broker に書く（外部ツールから見える）
//!
//! cron 式は UTC で評価する。`@every 30s` のような固定間隔も使える。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use croner::Cron;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::client::Client;
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};
use crate::presence::{SchedulerEnqueueEvent, SchedulerEntry};
use crate::task::{OptionType, Task, TaskOption};

/// Uniqueness window given to periodic tasks that do not set their own.
pub const DEFAULT_UNIQUE_TTL: Duration = Duration::from_secs(60);

/// Upper bound on one dispatch-loop sleep, so entries registered later are picked up.
const MAX_IDLE: Duration = Duration::from_secs(1);

/// A parsed schedule.
#[derive(Debug, Clone)]
enum Schedule {
    Cron(Cron),
    Every(chrono::Duration),
}

impl Schedule {
    fn parse(spec: &str) -> Result<Self> {
        if let Some(every) = spec.trim().strip_prefix("@every") {
            return parse_every(every.trim()).map(Schedule::Every);
        }
        Cron::new(spec)
            .with_seconds_optional()
            .parse()
            .map(Schedule::Cron)
            .map_err(|e| Error::InvalidOption(format!("invalid cron spec {spec:?}: {e}")))
    }

    fn next_after(&self, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            Schedule::Cron(cron) => cron
                .find_next_occurrence(&after, false)
                .map_err(|e| Error::Internal(format!("no next occurrence: {e}"))),
            Schedule::Every(every) => Ok(after + *every),
        }
    }
}

/// `30s`, `5m`, `1h`
fn parse_every(s: &str) -> Result<chrono::Duration> {
    let invalid = || Error::InvalidOption(format!("invalid @every interval {s:?}"));
    let split = s.find(|c: char| !c.is_ascii_digit()).ok_or_else(invalid)?;
    let (n, unit) = s.split_at(split);
    let n: i64 = n.parse().map_err(|_| invalid())?;
    let d = match unit {
        "s" => chrono::Duration::seconds(n),
        "m" => chrono::Duration::minutes(n),
        "h" => chrono::Duration::hours(n),
        _ => return Err(invalid()),
    };
    if d <= chrono::Duration::zero() {
        return Err(invalid());
    }
    Ok(d)
}

/// Task template registered under a name, e.g. from configuration.
/// The name doubles as the task kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodicTask {
    pub cron: String,
    pub payload: Vec<u8>,
    pub opts: Vec<TaskOption>,
}

impl PeriodicTask {
    /// The task's own options, then `TaskId(name)` and, unless one is already set,
    /// a default uniqueness window.
    fn options(&self, name: &str) -> Vec<TaskOption> {
        let mut opts = self.opts.clone();
        opts.push(TaskOption::TaskId(name.to_string()));
        if !self.opts.iter().any(|o| o.option_type() == OptionType::Unique) {
            opts.push(TaskOption::Unique(DEFAULT_UNIQUE_TTL));
        }
        opts
    }
}

#[derive(Debug)]
struct Entry {
    id: String,
    spec: String,
    schedule: Schedule,
    task: Task,
    opts: Vec<TaskOption>,
    next: DateTime<Utc>,
    prev: Option<DateTime<Utc>>,
}

impl Entry {
    fn snapshot(&self) -> SchedulerEntry {
        SchedulerEntry {
            id: self.id.clone(),
            spec: self.spec.clone(),
            kind: self.task.kind().to_string(),
            payload: self.task.payload().to_vec(),
            opts: self.opts.iter().map(|o| o.to_string()).collect(),
            next: self.next,
            prev: self.prev,
        }
    }
}

struct Inner {
    id: String,
    client: Client,
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    config: SchedulerConfig,
    entries: Mutex<BTreeMap<String, Entry>>,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    running: Option<(watch::Sender<bool>, Vec<JoinHandle<()>>)>,
}

impl Scheduler {
    pub fn new(client: Client, config: SchedulerConfig) -> Self {
        Self::with_clock(client, config, Arc::new(SystemClock))
    }

    pub fn with_clock(client: Client, config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let ids = UlidGenerator::new(Arc::clone(&clock));
        let broker = Arc::clone(client.broker());
        Self {
            inner: Arc::new(Inner {
                id: ids.generate(),
                client,
                broker,
                clock,
                ids,
                config,
                entries: Mutex::new(BTreeMap::new()),
            }),
            running: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Register `task` to be enqueued on `spec`. Returns the entry id.
    pub fn register(&self, spec: &str, task: Task, opts: Vec<TaskOption>) -> Result<String> {
        let schedule = Schedule::parse(spec)?;
        let next = schedule.next_after(self.inner.clock.now())?;
        let id = self.inner.ids.generate();
        info!(entry_id = %id, spec, kind = %task.kind(), next = %next, "scheduler entry registered");
        self.inner.lock().insert(
            id.clone(),
            Entry {
                id: id.clone(),
                spec: spec.to_string(),
                schedule,
                task,
                opts,
                next,
                prev: None,
            },
        );
        Ok(id)
    }

    /// Register a [`PeriodicTask`] under `name`.
    pub fn register_periodic(&self, name: &str, periodic: &PeriodicTask) -> Result<String> {
        let task = Task::new(name, periodic.payload.clone());
        self.register(&periodic.cron, task, periodic.options(name))
    }

    pub async fn unregister(&self, entry_id: &str) -> Result<()> {
        if self.inner.lock().remove(entry_id).is_none() {
            return Err(Error::Internal(format!("no scheduler entry {entry_id}")));
        }
        self.inner.broker.clear_scheduler_history(entry_id).await
    }

    pub fn entries(&self) -> Vec<SchedulerEntry> {
        self.inner.snapshot()
    }

    /// Spawn the dispatch loop and the heartbeat. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let joins = vec![
            tokio::spawn(Arc::clone(&self.inner).dispatch_loop(rx.clone())),
            tokio::spawn(Arc::clone(&self.inner).heartbeat_loop(rx)),
        ];
        info!(scheduler_id = %self.inner.id, "scheduler started");
        self.running = Some((tx, joins));
    }

    /// Stop both loops, then remove this scheduler's entries and history from the broker.
    pub async fn shutdown(mut self) {
        if let Some((tx, joins)) = self.running.take() {
            let _ = tx.send(true);
            for j in joins {
                let _ = j.await;
            }
        }
        self.inner.clear().await;
        info!(scheduler_id = %self.inner.id, "scheduler stopped");
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot(&self) -> Vec<SchedulerEntry> {
        self.lock().values().map(Entry::snapshot).collect()
    }

    /// Enqueue every entry whose next time has come, then move it forward.
    async fn fire_due(&self) -> usize {
        let now = self.clock.now();
        let due: Vec<(String, Task, Vec<TaskOption>)> = {
            let mut entries = self.lock();
            entries
                .values_mut()
                .filter(|e| e.next <= now)
                .map(|e| {
                    e.prev = Some(now);
                    e.next = e.schedule.next_after(now).unwrap_or_else(|err| {
                        error!(entry_id = %e.id, error = %err, "entry will not fire again");
                        DateTime::<Utc>::MAX_UTC
                    });
                    (e.id.clone(), e.task.clone(), e.opts.clone())
                })
                .collect()
        };

        let mut fired = 0;
        for (entry_id, task, opts) in due {
            match self.client.enqueue(&task, &opts).await {
                Ok(info) => {
                    fired += 1;
                    info!(entry_id = %entry_id, task_id = %info.id, kind = %info.kind, "scheduled task enqueued");
                    let event = SchedulerEnqueueEvent {
                        task_id: info.id,
                        enqueued_at: now,
                    };
                    if let Err(e) = self.broker.record_scheduler_enqueue_event(&entry_id, &event).await {
                        warn!(entry_id = %entry_id, error = %e, "could not record enqueue event");
                    }
                }
                Err(e) if e.is_already_exists() => {
                    debug!(entry_id = %entry_id, error = %e, "previous run still queued, skipping");
                }
                Err(e) => error!(entry_id = %entry_id, kind = %task.kind(), error = %e, "could not enqueue scheduled task"),
            }
        }
        fired
    }

    fn until_next(&self) -> Duration {
        let now = self.clock.now();
        self.lock()
            .values()
            .map(|e| (e.next - now).to_std().unwrap_or_default())
            .min()
            .unwrap_or(MAX_IDLE)
            .min(MAX_IDLE)
    }

    async fn dispatch_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(self.until_next()) => {}
            }
            self.fire_due().await;
        }
        debug!("scheduler dispatch loop stopped");
    }

    async fn heartbeat_loop(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }
            self.beat().await;
        }
    }

    async fn beat(&self) {
        let entries = self.snapshot();
        if let Err(e) = self
            .broker
            .write_scheduler_entries(&self.id, &entries, self.config.heartbeat_ttl)
            .await
        {
            warn!(scheduler_id = %self.id, error = %e, "could not write scheduler entries");
        }
    }

    async fn clear(&self) {
        if let Err(e) = self.broker.clear_scheduler_entries(&self.id).await {
            warn!(scheduler_id = %self.id, error = %e, "could not clear scheduler entries");
        }
        let ids: Vec<String> = self.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.broker.clear_scheduler_history(&id).await {
                warn!(entry_id = %id, error = %e, "could not clear scheduler history");
            }
        }
    }
}
