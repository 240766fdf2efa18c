//! Heartbeat - サーバーの生存通知とリース延長
//!
//! # 1 tick でやること
//! 1. `ServerInfo` と実行中タスクの `WorkerInfo` を TTL 付きで書く
//! 2. 有効なリースをキューごとにまとめて `extend_lease`、手元の `Lease` も延長
//! 3. すでに切れているリース（または延長に失敗したリース）は `notify_expiration`
//!    → processor 側のリース競合が発火して、そのタスクは失敗処理に回る
//!
//! 停止時は presence を消す。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::lease::Lease;
use crate::presence::{ServerInfo, ServerStatus, WorkerInfo};
use crate::processor::{ActiveTask, ActiveTasks};

pub(crate) struct Heartbeat {
    broker: Arc<dyn Broker>,
    info: ServerInfo,
    active: ActiveTasks,
    interval: Duration,
    ttl: Duration,
}

impl Heartbeat {
    pub(crate) fn new(
        broker: Arc<dyn Broker>,
        info: ServerInfo,
        active: ActiveTasks,
        interval: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            broker,
            info,
            active,
            interval,
            ttl,
        }
    }

    pub(crate) fn spawn(self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
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
            self.clear().await;
            debug!("heartbeat stopped");
        })
    }

    pub(crate) async fn beat(&self) {
        let active = self.active.snapshot();
        let workers: Vec<WorkerInfo> = active.iter().map(|t| self.worker_info(t)).collect();
        let info = ServerInfo {
            status: ServerStatus::Active,
            active_worker_count: workers.len(),
            ..self.info.clone()
        };
        if let Err(e) = self.broker.write_server_state(&info, &workers, self.ttl).await {
            warn!(error = %e, "could not write server state");
        }
        self.extend_leases(active).await;
    }

    async fn extend_leases(&self, active: Vec<ActiveTask>) {
        let mut by_queue: HashMap<String, Vec<(String, Arc<Lease>)>> = HashMap::new();
        for task in active {
            if !task.lease.is_valid() {
                task.lease.notify_expiration();
                continue;
            }
            by_queue
                .entry(task.msg.queue.clone())
                .or_default()
                .push((task.msg.id, task.lease));
        }

        for (queue, held) in by_queue {
            let ids: Vec<String> = held.iter().map(|(id, _)| id.clone()).collect();
            match self.broker.extend_lease(&queue, &ids).await {
                Ok(expire_at) => {
                    for (id, lease) in held {
                        if !lease.reset(expire_at) {
                            debug!(task_id = %id, "lease ran out before it could be extended");
                            lease.notify_expiration();
                        }
                    }
                }
                Err(e) => warn!(queue = %queue, error = %e, "could not extend leases"),
            }
        }
    }

    async fn clear(&self) {
        if let Err(e) = self
            .broker
            .clear_server_state(&self.info.host, self.info.pid, &self.info.server_id)
            .await
        {
            warn!(error = %e, "could not clear server state");
        }
    }

    fn worker_info(&self, task: &ActiveTask) -> WorkerInfo {
        WorkerInfo {
            host: self.info.host.clone(),
            pid: self.info.pid,
            server_id: self.info.server_id.clone(),
            task_id: task.msg.id.clone(),
            kind: task.msg.kind.clone(),
            queue: task.msg.queue.clone(),
            started: task.started,
            deadline: task.deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::ports::{Clock, FixedClock};
    use crate::task::TaskMessage;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::BTreeMap;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn server_info() -> ServerInfo {
        ServerInfo {
            host: "box".into(),
            pid: 42,
            server_id: "S1".into(),
            concurrency: 4,
            queues: BTreeMap::from([("default".to_string(), 1)]),
            strict_priority: false,
            status: ServerStatus::Active,
            started: t0(),
            active_worker_count: 0,
        }
    }

    async fn hold(
        broker: &InMemoryBroker,
        clock: &FixedClock,
        active: &ActiveTasks,
        id: &str,
    ) -> Arc<Lease> {
        broker
            .enqueue(&TaskMessage::new("x", vec![], id, "default"))
            .await
            .unwrap();
        let (msg, expires) = broker.dequeue(&["default".to_string()]).await.unwrap();
        let lease = Arc::new(Lease::new(expires, Arc::new(clock.clone())));
        active.insert(ActiveTask {
            msg,
            lease: Arc::clone(&lease),
            started: clock.now(),
            deadline: clock.now() + chrono::Duration::minutes(30),
        });
        lease
    }

    #[tokio::test]
    async fn beat_publishes_workers_and_extends_leases() {
        let clock = FixedClock::new(t0());
        let broker = InMemoryBroker::with_clock(Arc::new(clock.clone()));
        let active = ActiveTasks::default();
        let lease = hold(&broker, &clock, &active, "a").await;

        clock.advance(chrono::Duration::minutes(10));
        let hb = Heartbeat::new(
            Arc::new(broker.clone()),
            server_info(),
            active,
            Duration::from_secs(3),
            Duration::from_secs(5),
        );
        hb.beat().await;

        let servers = broker.servers().await;
        assert_eq!(servers.len(), 1);
        let (info, workers) = &servers[0];
        assert_eq!(info.active_worker_count, 1);
        assert_eq!(workers[0].task_id, "a");

        let want = clock.now() + chrono::Duration::minutes(30);
        assert_eq!(lease.deadline(), want);
        assert_eq!(
            broker.lease_expiration("default", "a").await,
            Some(DateTime::from_timestamp(want.timestamp(), 0).unwrap())
        );
    }

    #[tokio::test]
    async fn invalid_leases_are_notified_not_extended() {
        let clock = FixedClock::new(t0());
        let broker = InMemoryBroker::with_clock(Arc::new(clock.clone()));
        let active = ActiveTasks::default();
        let lease = hold(&broker, &clock, &active, "a").await;
        let before = broker.lease_expiration("default", "a").await;

        clock.advance(chrono::Duration::minutes(31));
        let hb = Heartbeat::new(
            Arc::new(broker.clone()),
            server_info(),
            active,
            Duration::from_secs(3),
            Duration::from_secs(5),
        );
        hb.beat().await;

        assert!(lease.is_expiration_notified());
        assert_eq!(broker.lease_expiration("default", "a").await, before);
    }

    #[tokio::test]
    async fn shutdown_clears_presence() {
        let clock = FixedClock::new(t0());
        let broker = InMemoryBroker::with_clock(Arc::new(clock.clone()));
        let hb = Heartbeat::new(
            Arc::new(broker.clone()),
            server_info(),
            ActiveTasks::default(),
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        let (tx, rx) = watch::channel(false);
        let handle = hb.spawn(rx);
        for _ in 0..100 {
            if !broker.servers().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(broker.servers().await.len(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert!(broker.servers().await.is_empty());
    }
}
