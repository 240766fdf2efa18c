//! Processor - dequeue → 実行 → 結果の反映
//!
//! # フロー
//! 1. Semaphore で同時実行枠を 1 つ確保（`concurrency` 個まで）
//! 2. キュー順序を決めて `Broker::dequeue`（空なら `poll_interval` 待つ）
//! 3. タスクごとに tokio タスクを起こし、次の 4 つのうち最初に来たものを採用
//!    - abort（シャットダウン猶予切れ）→ リースが有効なら requeue
//!    - リース切れ → 失敗扱い
//!    - 期限（timeout / deadline）切れ、またはキャンセル → 失敗扱い
//!    - ハンドラの結果
//! 4. 成功なら done / mark_as_complete、失敗なら decision に従って retry / archive
//!
//! broker への書き込みはすべて `Lease::is_valid` が真のときだけ行う。
//! リースを失ったタスクは別プロセスの回収処理のもの。

pub mod decision;
pub(crate) mod panic;
pub(crate) mod queues;
pub mod retry;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::decision::{Decision, ErrorHandlerFn, IsFailureFn};
use self::queues::QueueOrder;
use self::retry::RetryDelayFn;
use crate::broker::Broker;
use crate::context::{Cancellations, TaskContext};
use crate::error::Error;
use crate::handler::{Handler, HandlerError};
use crate::lease::Lease;
use crate::ports::Clock;
use crate::task::{Task, TaskMessage};

/// One task currently held by this process.
#[derive(Debug, Clone)]
pub(crate) struct ActiveTask {
    pub msg: TaskMessage,
    pub lease: Arc<Lease>,
    pub started: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// In-flight tasks, shared with the heartbeat.
#[derive(Debug, Clone, Default)]
pub(crate) struct ActiveTasks {
    inner: Arc<Mutex<HashMap<String, ActiveTask>>>,
}

impl ActiveTasks {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveTask>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn insert(&self, task: ActiveTask) {
        self.lock().insert(task.msg.id.clone(), task);
    }

    pub(crate) fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    pub(crate) fn snapshot(&self) -> Vec<ActiveTask> {
        self.lock().values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Hooks that shape failure handling.
#[derive(Clone)]
pub(crate) struct FailurePolicy {
    pub retry_delay: RetryDelayFn,
    pub is_failure: IsFailureFn,
    pub error_handler: Option<ErrorHandlerFn>,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self {
            retry_delay: Arc::new(retry::default_retry_delay),
            is_failure: Arc::new(|_| true),
            error_handler: None,
        }
    }
}

pub(crate) struct ProcessorParams {
    pub broker: Arc<dyn Broker>,
    pub clock: Arc<dyn Clock>,
    pub handler: Arc<dyn Handler>,
    pub queues: BTreeMap<String, u32>,
    pub strict_priority: bool,
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub shutdown_timeout: Duration,
    pub policy: FailurePolicy,
    pub cancellations: Cancellations,
    pub active: ActiveTasks,
}

pub(crate) struct Processor {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    handler: Arc<dyn Handler>,
    order: QueueOrder,
    concurrency: u32,
    poll_interval: Duration,
    shutdown_timeout: Duration,
    policy: FailurePolicy,
    cancellations: Cancellations,
    active: ActiveTasks,
    sema: Arc<Semaphore>,
    /// Stop dequeuing.
    quit: CancellationToken,
    /// Stop in-flight tasks.
    abort: CancellationToken,
}

impl Processor {
    pub(crate) fn new(params: ProcessorParams) -> Arc<Self> {
        let concurrency = u32::try_from(params.concurrency.max(1)).unwrap_or(u32::MAX);
        Arc::new(Self {
            broker: params.broker,
            clock: params.clock,
            handler: params.handler,
            order: QueueOrder::new(&params.queues, params.strict_priority),
            concurrency,
            poll_interval: params.poll_interval,
            shutdown_timeout: params.shutdown_timeout,
            policy: params.policy,
            cancellations: params.cancellations,
            active: params.active,
            sema: Arc::new(Semaphore::new(concurrency as usize)),
            quit: CancellationToken::new(),
            abort: CancellationToken::new(),
        })
    }

    pub(crate) fn queue_names(&self) -> Vec<String> {
        self.order.names()
    }

    pub(crate) fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    /// Stop dequeuing, give in-flight tasks `shutdown_timeout` to finish, then abort the rest.
    pub(crate) async fn shutdown(&self, handle: JoinHandle<()>) {
        self.quit.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "dispatch loop ended abnormally");
        }

        let drained = tokio::time::timeout(
            self.shutdown_timeout,
            self.sema.acquire_many(self.concurrency),
        )
        .await;
        if drained.is_err() {
            warn!(
                in_flight = self.active.len(),
                "shutdown timeout elapsed, aborting in-flight tasks"
            );
            self.abort.cancel();
            let _ = self.sema.acquire_many(self.concurrency).await;
        }
        info!("processor stopped");
    }

    async fn run(self: Arc<Self>) {
        loop {
            let permit = tokio::select! {
                _ = self.quit.cancelled() => break,
                permit = Arc::clone(&self.sema).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };
            if self.quit.is_cancelled() {
                break;
            }

            let queues = self.order.next(&mut rand::thread_rng());
            match self.broker.dequeue(&queues).await {
                Ok((msg, lease_expires_at)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        this.execute(msg, lease_expires_at).await;
                        drop(permit);
                    });
                }
                Err(Error::NoProcessableTask) => {
                    drop(permit);
                    debug!("all queues are empty");
                    self.idle().await;
                }
                Err(e) => {
                    drop(permit);
                    error!(error = %e, "dequeue failed");
                    self.idle().await;
                }
            }
        }
        debug!("dispatch loop stopped");
    }

    async fn idle(&self) {
        tokio::select! {
            _ = self.quit.cancelled() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    async fn execute(&self, msg: TaskMessage, lease_expires_at: DateTime<Utc>) {
        let lease = Arc::new(Lease::new(lease_expires_at, Arc::clone(&self.clock)));
        let now = self.clock.now();
        let deadline = msg.effective_deadline(now);
        let until_deadline = (deadline - now).to_std().unwrap_or_default();

        let token = CancellationToken::new();
        self.cancellations.add(&msg.id, token.clone());
        self.active.insert(ActiveTask {
            msg: msg.clone(),
            lease: Arc::clone(&lease),
            started: now,
            deadline,
        });

        let ctx = TaskContext::new(&msg, deadline, token.clone(), Arc::clone(&self.broker));
        let task = Task::from_message(&msg);
        let handler = Arc::clone(&self.handler);
        debug!(task_id = %msg.id, queue = %msg.queue, kind = %msg.kind, "processing task");

        let outcome = tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            _ = lease.expired() => Some(Err(HandlerError::new("task lease expired"))),
            _ = tokio::time::sleep(until_deadline) => {
                Some(Err(HandlerError::new("task deadline exceeded")))
            }
            _ = token.cancelled() => Some(Err(HandlerError::new("task canceled"))),
            res = panic::run_contained(async move { handler.process(ctx, task).await }) => Some(res),
        };

        token.cancel();
        self.cancellations.remove(&msg.id);
        self.active.remove(&msg.id);

        match outcome {
            None => self.requeue_aborted(&msg, &lease).await,
            Some(Ok(())) => self.handle_success(&msg, &lease).await,
            Some(Err(err)) => self.handle_failure(&msg, &lease, err).await,
        }
    }

    async fn requeue_aborted(&self, msg: &TaskMessage, lease: &Lease) {
        if !lease.is_valid() {
            warn!(task_id = %msg.id, "lease expired before requeue, leaving task to recovery");
            return;
        }
        match self.broker.requeue(msg).await {
            Ok(()) => info!(task_id = %msg.id, queue = %msg.queue, "task requeued on shutdown"),
            Err(e) => error!(task_id = %msg.id, error = %e, "could not requeue task"),
        }
    }

    async fn handle_success(&self, msg: &TaskMessage, lease: &Lease) {
        if !lease.is_valid() {
            warn!(task_id = %msg.id, "lease expired before completion, leaving task to recovery");
            return;
        }
        let res = if msg.retention > 0 {
            self.broker.mark_as_complete(msg).await
        } else {
            self.broker.done(msg).await
        };
        match res {
            Ok(()) => debug!(task_id = %msg.id, "task done"),
            Err(e) => error!(task_id = %msg.id, error = %e, "could not record task completion"),
        }
    }

    async fn handle_failure(&self, msg: &TaskMessage, lease: &Lease, err: HandlerError) {
        let task = Task::from_message(msg);
        if let Some(on_error) = &self.policy.error_handler {
            on_error(&task, &err);
        }
        if !lease.is_valid() {
            warn!(task_id = %msg.id, error = %err, "lease expired, leaving failed task to recovery");
            return;
        }

        let is_failure = (self.policy.is_failure)(&err);
        let decision = decision::decide(msg, &err, is_failure, || {
            (self.policy.retry_delay)(msg.retried, &err, &task)
        });
        match decision {
            Decision::Retry { delay, is_failure } => {
                let now = self.clock.now();
                let retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                info!(
                    task_id = %msg.id,
                    queue = %msg.queue,
                    error = %err,
                    retried = msg.retried,
                    retry_in_secs = delay.as_secs(),
                    "task failed, retrying"
                );
                if let Err(e) = self
                    .broker
                    .retry(msg, retry_at, err.message(), is_failure)
                    .await
                {
                    error!(task_id = %msg.id, error = %e, "could not move task to retry");
                }
            }
            Decision::Archive => {
                warn!(
                    task_id = %msg.id,
                    queue = %msg.queue,
                    error = %err,
                    retried = msg.retried,
                    "task failed, archiving"
                );
                if let Err(e) = self.broker.archive(msg, err.message()).await {
                    error!(task_id = %msg.id, error = %e, "could not archive task");
                }
            }
        }
    }
}
