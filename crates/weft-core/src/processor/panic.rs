//! Panic containment for handlers.
//!
//! ハンドラは独立した tokio タスクで動かし、panic は `JoinError` として受け取る。
//! 発生位置は panic hook が task-local のスロットに書き込む（hook はプロセスで一度だけ登録）。

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Once};
use std::task::{Context, Poll};

use tokio::task::{JoinError, JoinHandle};

use crate::handler::HandlerError;

tokio::task_local! {
    static PANIC_LOCATION: Arc<Mutex<Option<String>>>;
}

static INSTALL_HOOK: Once = Once::new();

fn install_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(location) = info.location() {
                let at = format!("{}:{}", location.file(), location.line());
                let _ = PANIC_LOCATION.try_with(|slot| {
                    *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(at);
                });
            }
            previous(info);
        }));
    });
}

/// Aborts the spawned task when dropped, so losing a race also stops the handler.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

/// Run a handler future on its own task; a panic comes back as a [`HandlerError`].
pub(crate) async fn run_contained<F>(fut: F) -> Result<(), HandlerError>
where
    F: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    install_hook();
    let slot = Arc::new(Mutex::new(None));
    let handle = AbortOnDrop(tokio::spawn(PANIC_LOCATION.scope(Arc::clone(&slot), fut)));

    match handle.await {
        Ok(res) => res,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            let location = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
            Err(HandlerError::panicked(location, &message))
        }
        Err(_) => Err(HandlerError::new("task was cancelled")),
    }
}
