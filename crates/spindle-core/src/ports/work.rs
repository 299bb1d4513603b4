//! WorkFunction port - 呼び出し元が注入する実処理
//!
//! エンジンは work function の中身を知らない。
//! `(kind, input)` を渡して `Result<Value, WorkError>` を受け取るだけ。

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::domain::ids::TaskId;
use crate::domain::task::TaskKind;
use crate::ports::{Clock, TaskStore};

/// Failure reported by a work function.
///
/// `to_string()` becomes the task's error message; the `source()` chain is
/// kept as its stack trace.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct WorkError {
    message: String,
    #[source]
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl WorkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl Into<Box<dyn StdError + Send + Sync>>,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// One `caused by:` line per error in the source chain.
    pub fn stack_trace(&self) -> Option<String> {
        let mut lines = Vec::new();
        let mut cause = StdError::source(self);
        while let Some(err) = cause {
            lines.push(format!("caused by: {err}"));
            cause = err.source();
        }
        (!lines.is_empty()).then(|| lines.join("\n"))
    }
}

impl From<serde_json::Error> for WorkError {
    fn from(err: serde_json::Error) -> Self {
        WorkError::with_source(format!("json: {err}"), err)
    }
}

/// Receiving side of a task's cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested.
    ///
    /// Never resolves if the sending side is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        let closed = self.rx.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Sending side of a task's cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        // receivers may already be gone; the flag is still recorded
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// Lets a running work function publish advisory progress.
#[derive(Clone)]
pub struct ProgressReporter {
    id: TaskId,
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
}

impl ProgressReporter {
    pub fn new(id: TaskId, store: Arc<dyn TaskStore>, clock: Arc<dyn Clock>) -> Self {
        Self { id, store, clock }
    }

    /// Returns whether the value was applied (Running and not lower than before).
    pub fn report(&self, progress: u8) -> bool {
        let now = self.clock.now();
        let mut applied = false;
        let updated = self.store.modify(self.id, &mut |record| {
            applied = record.report_progress(progress, now);
            Ok(())
        });
        updated.is_ok() && applied
    }
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter").field("id", &self.id).finish()
    }
}

/// Per-invocation context handed to the work function.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub task_id: TaskId,
    pub cancel: CancelSignal,
    pub progress: ProgressReporter,
}

/// A work function executes one task body.
///
/// Errors become the task's `Failed` state; they never escape the engine.
#[async_trait]
pub trait WorkFunction: Send + Sync {
    async fn run(
        &self,
        kind: &TaskKind,
        input: serde_json::Value,
        ctx: WorkContext,
    ) -> Result<serde_json::Value, WorkError>;
}

/// Closure adapter, see [`work_fn`].
pub struct FnWork<F>(F);

/// Wrap an async closure as a [`WorkFunction`].
///
/// ```ignore
/// let work = work_fn(|kind, input, _ctx| async move {
///     Ok(serde_json::json!({ "kind": kind.as_str(), "echo": input }))
/// });
/// ```
pub fn work_fn<F, Fut>(f: F) -> FnWork<F>
where
    F: Fn(TaskKind, serde_json::Value, WorkContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, WorkError>> + Send + 'static,
{
    FnWork(f)
}

#[async_trait]
impl<F, Fut> WorkFunction for FnWork<F>
where
    F: Fn(TaskKind, serde_json::Value, WorkContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, WorkError>> + Send + 'static,
{
    async fn run(
        &self,
        kind: &TaskKind,
        input: serde_json::Value,
        ctx: WorkContext,
    ) -> Result<serde_json::Value, WorkError> {
        (self.0)(kind.clone(), input, ctx).await
    }
}
