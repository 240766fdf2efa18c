//! Server - ハンドラ登録とバックグラウンド処理の組み立て
//!
//! # 学習ポイント
//! - Builder パターン（ハンドラ・フック・設定を積んでから `build`）
//! - 起動時検証（`expect_kinds` で宣言した kind にハンドラがなければ build 失敗）
//!
//! # 起動するもの
//! - Processor（dequeue → 実行）
//! - Forwarder / Janitor / Heartbeat（一定間隔）
//!
//! 停止は Processor が先。実行中タスクの後始末が終わるまで Heartbeat がリースを延長し続ける。

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::broker::Broker;
use crate::config::ServerConfig;
use crate::context::{Cancellations, TaskContext};
use crate::forwarder::Forwarder;
use crate::handler::{Handler, HandlerError, RegistryError, ServeMux, TypedHandler, TypedTask};
use crate::heartbeat::Heartbeat;
use crate::janitor::Janitor;
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};
use crate::presence::{ServerInfo, ServerStatus};
use crate::processor::decision::{ErrorHandlerFn, IsFailureFn};
use crate::processor::retry::RetryDelayFn;
use crate::processor::{ActiveTasks, FailurePolicy, Processor, ProcessorParams};
use crate::task::Task;

/// ServerBuilder は Server を構築
///
/// # 使用例
/// ```ignore
/// let server = ServerBuilder::new(broker)
///     .config(config)
///     .register::<SendEmail, _>(SendEmailHandler)?
///     .handle_fn("report:", |ctx, task| async move { build_report(ctx, task).await })?
///     .expect_kinds(&["email:send", "report:daily"])
///     .build()?;
/// ```
pub struct ServerBuilder {
    broker: Arc<dyn Broker>,
    config: ServerConfig,
    mux: ServeMux,
    expected_kinds: Option<Vec<String>>,
    policy: FailurePolicy,
    clock: Arc<dyn Clock>,
}

/// BuildError は Server 構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing task kinds: {0:?}. These kinds were expected but no handler matches them.")]
    MissingKinds(Vec<String>),

    #[error("no queue has a positive weight")]
    NoQueues,
}

impl ServerBuilder {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            config: ServerConfig::default(),
            mux: ServeMux::new(),
            expected_kinds: None,
            policy: FailurePolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Handler を pattern に登録（完全一致、または kind の接頭辞）
    pub fn handle(
        mut self,
        pattern: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Result<Self, RegistryError> {
        self.mux.handle(pattern, handler)?;
        Ok(self)
    }

    pub fn handle_fn<F, Fut>(mut self, pattern: impl Into<String>, f: F) -> Result<Self, RegistryError>
    where
        F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.mux.handle_fn(pattern, f)?;
        Ok(self)
    }

    /// 型付きハンドラを `T::KIND` に登録
    pub fn register<T: TypedTask, H: TypedHandler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.mux.register::<T, H>(handler)?;
        Ok(self)
    }

    /// 期待される kind のリストを設定（build 時にチェック）
    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn retry_delay_fn(mut self, f: RetryDelayFn) -> Self {
        self.policy.retry_delay = f;
        self
    }

    pub fn is_failure_fn(mut self, f: IsFailureFn) -> Self {
        self.policy.is_failure = f;
        self
    }

    pub fn error_handler(mut self, f: ErrorHandlerFn) -> Self {
        self.policy.error_handler = Some(f);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// # 検証
    /// - expect_kinds() の kind すべてに、いずれかのハンドラがマッチすること
    /// - 正の重みを持つキューが 1 つ以上あること
    pub fn build(self) -> Result<Server, BuildError> {
        if let Some(expected) = &self.expected_kinds {
            let missing: Vec<String> = expected
                .iter()
                .filter(|kind| self.mux.get(kind).is_none())
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingKinds(missing));
            }
        }
        if !self.config.queues.values().any(|w| *w > 0) {
            return Err(BuildError::NoQueues);
        }

        let ids = UlidGenerator::new(Arc::clone(&self.clock));
        let info = ServerInfo {
            host: self.config.effective_host(),
            pid: std::process::id(),
            server_id: ids.generate(),
            concurrency: self.config.effective_concurrency(),
            queues: self.config.queues.clone(),
            strict_priority: self.config.strict_priority,
            status: ServerStatus::Active,
            started: self.clock.now(),
            active_worker_count: 0,
        };
        Ok(Server {
            broker: self.broker,
            clock: self.clock,
            config: self.config,
            handler: Arc::new(self.mux),
            policy: self.policy,
            cancellations: Cancellations::new(),
            active: ActiveTasks::default(),
            info,
            running: None,
        })
    }
}

struct Running {
    processor: Arc<Processor>,
    dispatch: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

pub struct Server {
    broker: Arc<dyn Broker>,
    clock: Arc<dyn Clock>,
    config: ServerConfig,
    handler: Arc<dyn Handler>,
    policy: FailurePolicy,
    cancellations: Cancellations,
    active: ActiveTasks,
    info: ServerInfo,
    running: Option<Running>,
}

impl Server {
    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Spawn the processor and the periodic components. Calling it twice is a no-op.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let processor = Processor::new(ProcessorParams {
            broker: Arc::clone(&self.broker),
            clock: Arc::clone(&self.clock),
            handler: Arc::clone(&self.handler),
            queues: self.config.queues.clone(),
            strict_priority: self.config.strict_priority,
            concurrency: self.info.concurrency,
            poll_interval: self.config.poll_interval,
            shutdown_timeout: self.config.shutdown_timeout,
            policy: self.policy.clone(),
            cancellations: self.cancellations.clone(),
            active: self.active.clone(),
        });
        let queues = processor.queue_names();
        let dispatch = processor.start();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let joins = vec![
            Forwarder::new(
                Arc::clone(&self.broker),
                queues.clone(),
                self.config.forwarder_interval,
            )
            .spawn(shutdown_rx.clone()),
            Janitor::new(Arc::clone(&self.broker), queues, self.config.janitor_interval)
                .spawn(shutdown_rx.clone()),
            Heartbeat::new(
                Arc::clone(&self.broker),
                self.info.clone(),
                self.active.clone(),
                self.config.heartbeat_interval,
                self.config.heartbeat_ttl,
            )
            .spawn(shutdown_rx),
        ];

        info!(
            server_id = %self.info.server_id,
            host = %self.info.host,
            pid = self.info.pid,
            concurrency = self.info.concurrency,
            "server started"
        );
        self.running = Some(Running {
            processor,
            dispatch,
            shutdown_tx,
            joins,
        });
    }

    /// Cancel a task running in this process. Returns false if it is not running here.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.cancellations.cancel(task_id)
    }

    /// Stop dequeuing, drain or abort in-flight tasks, then stop the periodic components.
    pub async fn shutdown(mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.processor.shutdown(running.dispatch).await;

        let _ = running.shutdown_tx.send(true);
        for j in running.joins {
            let _ = j.await;
        }
        info!(server_id = %self.info.server_id, "server stopped");
    }
}
