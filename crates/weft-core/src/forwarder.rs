//! Forwarder - 期限が来た scheduled / retry タスクを pending に移す
//!
//! 一定間隔で `Broker::forward_if_ready` を呼ぶだけ。
//! 移動は broker のスクリプト内で完結するので、複数プロセスで同時に動いても問題ない。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::broker::Broker;

pub(crate) struct Forwarder {
    broker: Arc<dyn Broker>,
    queues: Vec<String>,
    interval: Duration,
}

impl Forwarder {
    pub(crate) fn new(broker: Arc<dyn Broker>, queues: Vec<String>, interval: Duration) -> Self {
        Self {
            broker,
            queues,
            interval,
        }
    }

    /// `shutdown_rx` が true になるか sender が drop されると止まる。
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
                self.forward().await;
            }
            debug!("forwarder stopped");
        })
    }

    pub(crate) async fn forward(&self) -> usize {
        match self.broker.forward_if_ready(&self.queues).await {
            Ok(0) => 0,
            Ok(moved) => {
                debug!(moved, "forwarded ready tasks");
                moved
            }
            Err(e) => {
                error!(error = %e, "could not forward scheduled tasks");
                0
            }
        }
    }
}
