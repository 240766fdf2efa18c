//! weft-core
//!
//! Redis をバックエンドにした分散タスクキュー。
//!
//! # モジュール構成
//! - **broker**: 状態遷移の原子的な実装（Redis スクリプト版 + インメモリ版）
//! - **task**: TaskMessage / Task / TaskOption
//! - **client**: enqueue
//! - **handler / context**: ハンドラ契約、ServeMux、実行中タスクのコンテキスト
//! - **processor**: dequeue → 実行 → done / retry / archive
//! - **forwarder / janitor / heartbeat**: 一定間隔で動く補助処理
//! - **scheduler**: cron による定期 enqueue
//! - **server**: 上記を組み立てる ServerBuilder / Server
//! - **ports**: Clock / IdGenerator の抽象化
//! - **config / error / keys / lease / presence**

pub mod broker;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
mod forwarder;
pub mod handler;
mod heartbeat;
mod janitor;
pub mod keys;
pub mod lease;
pub mod ports;
pub mod presence;
pub mod processor;
pub mod scheduler;
pub mod server;
pub mod task;

pub use crate::broker::{Broker, InMemoryBroker, RedisBroker};
pub use crate::client::Client;
pub use crate::config::{BrokerConfig, SchedulerConfig, ServerConfig};
pub use crate::context::{ResultWriter, TaskContext};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::handler::{
    Handler, HandlerError, RegistryError, ServeMux, TypedHandler, TypedTask, handler_fn,
};
pub use crate::keys::KeySpace;
pub use crate::scheduler::{PeriodicTask, Scheduler};
pub use crate::server::{BuildError, Server, ServerBuilder};
pub use crate::task::{Task, TaskInfo, TaskMessage, TaskOption, TaskState};
