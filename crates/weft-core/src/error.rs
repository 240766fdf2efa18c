//! Errors - broker / client 層のエラー型
//!
//! ハンドラの失敗（タスクの失敗）はここには含めない。
//! それは [`crate::handler::HandlerError`] として processor の失敗処理に流れる。

use thiserror::Error;

/// 運用上の分類
///
/// - AlreadyExists: 重複タスク / ID 衝突（自動リトライしない）
/// - NotFound: 処理可能なタスクがない（定常状態、呼び出し側が待って再試行）
/// - Internal: スクリプト / (de)serialize の失敗
/// - Unknown: ストアとの通信失敗
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AlreadyExists,
    NotFound,
    Internal,
    Unknown,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("task ID conflicts with another task")]
    TaskIdConflict,

    #[error("task already exists (unique key {0})")]
    DuplicateTask(String),

    #[error("no processable task found")]
    NoProcessableTask,

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("cannot encode or decode message: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("{0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TaskIdConflict | Error::DuplicateTask(_) => ErrorKind::AlreadyExists,
            Error::NoProcessableTask | Error::TaskNotFound(_) => ErrorKind::NotFound,
            Error::InvalidOption(_) | Error::Codec(_) | Error::Internal(_) => ErrorKind::Internal,
            Error::Redis(_) => ErrorKind::Unknown,
        }
    }

    pub fn is_already_exists(&self) -> bool {
        self.kind() == ErrorKind::AlreadyExists
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
