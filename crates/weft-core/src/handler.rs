//! Handler - タスク種別ごとの処理
//!
//! # 構成
//! - [`Handler`]: `(TaskContext, Task) -> Result<(), HandlerError>` の object-safe trait
//! - [`handler_fn`]: async クロージャを Handler にする
//! - [`TypedTask`] / [`TypedHandler`]: payload を JSON で型付きにデコードする版
//! - [`ServeMux`]: kind -> Handler のルーティング（完全一致 → 最長プレフィックス一致）
//!
//! `Ok(())` が成功、`Err` は processor の失敗処理（retry / archive）に回る。

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::context::TaskContext;
use crate::error::Result;
use crate::task::{Task, TaskOption};

/// タスクの失敗
///
/// broker のエラーとは別物。メッセージは `error_msg` に記録される。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    skip_retry: bool,
    panic_location: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            skip_retry: false,
            panic_location: None,
        }
    }

    /// Archive immediately instead of retrying.
    pub fn skip_retry(message: impl Into<String>) -> Self {
        Self {
            skip_retry: true,
            ..Self::new(message)
        }
    }

    pub(crate) fn panicked(location: Option<String>, message: &str) -> Self {
        let message = match &location {
            Some(at) => format!("panic [{at}]: {message}"),
            None => format!("panic: {message}"),
        };
        Self {
            message,
            skip_retry: false,
            panic_location: location,
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_skip_retry(&self) -> bool {
        self.skip_retry
    }

    /// `file:line` of the panic, if the handler panicked.
    pub fn panic_location(&self) -> Option<&str> {
        self.panic_location.as_deref()
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(e.to_string())
    }
}

impl From<crate::error::Error> for HandlerError {
    fn from(e: crate::error::Error) -> Self {
        Self::new(e.to_string())
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn process(&self, ctx: TaskContext, task: Task) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn process(&self, ctx: TaskContext, task: Task) -> Result<(), HandlerError> {
        (**self).process(ctx, task).await
    }
}

pub struct HandlerFn<F> {
    f: F,
}

/// ```ignore
/// let h = handler_fn(|_ctx, task: Task| async move {
///     tracing::info!(kind = task.kind(), "hello");
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(TaskContext, Task) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn process(&self, ctx: TaskContext, task: Task) -> Result<(), HandlerError> {
        (self.f)(ctx, task).await
    }
}

/// kind と型の対応付け
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail { to: String }
///
/// impl TypedTask for SendEmail {
///     const KIND: &'static str = "email:send";
/// }
///
/// let task = SendEmail { to: "a@example.com".into() }.into_task()?;
/// ```
pub trait TypedTask: Serialize + DeserializeOwned + Send + Sync + 'static {
    const KIND: &'static str;

    /// Options every enqueue of this type starts with.
    fn default_options() -> Vec<TaskOption> {
        Vec::new()
    }

    fn into_task(&self) -> Result<Task> {
        Ok(Task::new(Self::KIND, serde_json::to_vec(self)?).with_options(Self::default_options()))
    }
}

#[async_trait]
pub trait TypedHandler<T: TypedTask>: Send + Sync {
    async fn handle(&self, ctx: TaskContext, task: T) -> Result<(), HandlerError>;
}

/// TypedHandler<T> を型消去して Handler にするラッパー
struct Typed<T: TypedTask, H: TypedHandler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

#[async_trait]
impl<T: TypedTask, H: TypedHandler<T>> Handler for Typed<T, H> {
    async fn process(&self, ctx: TaskContext, task: Task) -> Result<(), HandlerError> {
        // デコードできない payload は何度やっても失敗する
        let typed: T = serde_json::from_slice(task.payload()).map_err(|e| {
            HandlerError::skip_retry(format!("cannot decode {} payload: {e}", T::KIND))
        })?;
        self.handler.handle(ctx, typed).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for task kind {0:?} is already registered")]
    AlreadyRegistered(String),

    #[error("handler pattern must not be empty")]
    EmptyPattern,
}

/// kind -> Handler
///
/// 完全一致を優先し、なければ登録済みパターンのうち kind の接頭辞になっている最長のものを使う。
/// 例: `"email:"` は `"email:send"` と `"email:bounce"` の両方を受ける。
#[derive(Default, Clone)]
pub struct ServeMux {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl ServeMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(
        &mut self,
        pattern: impl Into<String>,
        handler: impl Handler + 'static,
    ) -> Result<(), RegistryError> {
        let pattern = pattern.into();
        if pattern.trim().is_empty() {
            return Err(RegistryError::EmptyPattern);
        }
        if self.handlers.contains_key(&pattern) {
            return Err(RegistryError::AlreadyRegistered(pattern));
        }
        self.handlers.insert(pattern, Arc::new(handler));
        Ok(())
    }

    pub fn handle_fn<F, Fut>(
        &mut self,
        pattern: impl Into<String>,
        f: F,
    ) -> Result<(), RegistryError>
    where
        F: Fn(TaskContext, Task) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handle(pattern, handler_fn(f))
    }

    pub fn register<T: TypedTask, H: TypedHandler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.handle(
            T::KIND,
            Typed {
                handler,
                _marker: PhantomData,
            },
        )
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        if let Some(h) = self.handlers.get(kind) {
            return Some(Arc::clone(h));
        }
        self.handlers
            .iter()
            .filter(|(pattern, _)| kind.starts_with(pattern.as_str()))
            .max_by_key(|(pattern, _)| pattern.len())
            .map(|(_, h)| Arc::clone(h))
    }

    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.handlers.keys().cloned().collect();
        patterns.sort();
        patterns
    }
}

#[async_trait]
impl Handler for ServeMux {
    async fn process(&self, ctx: TaskContext, task: Task) -> Result<(), HandlerError> {
        match self.get(task.kind()) {
            Some(handler) => handler.process(ctx, task).await,
            None => Err(HandlerError::new(format!(
                "handler not found for task {:?}",
                task.kind()
            ))),
        }
    }
}
