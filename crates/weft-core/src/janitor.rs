//! Janitor - 保持期限を過ぎた completed タスクを削除する

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::broker::Broker;

pub(crate) struct Janitor {
    broker: Arc<dyn Broker>,
    queues: Vec<String>,
    interval: Duration,
}

impl Janitor {
    pub(crate) fn new(broker: Arc<dyn Broker>, queues: Vec<String>, interval: Duration) -> Self {
        Self {
            broker,
            queues,
            interval,
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
                self.sweep().await;
            }
            debug!("janitor stopped");
        })
    }

    /// One pass over every queue. A failing queue does not stop the others.
    pub(crate) async fn sweep(&self) -> usize {
        let mut deleted = 0;
        for queue in &self.queues {
            match self.broker.delete_expired_completed_tasks(queue).await {
                Ok(n) => {
                    if n > 0 {
                        debug!(queue = %queue, deleted = n, "deleted expired completed tasks");
                    }
                    deleted += n;
                }
                Err(e) => warn!(queue = %queue, error = %e, "could not delete expired completed tasks"),
            }
        }
        deleted
    }
}
