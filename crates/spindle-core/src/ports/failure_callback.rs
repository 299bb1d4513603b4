//! FailureCallback port - 失敗時に呼ばれる observer
//!
//! Callbacks only observe. Their errors (and panics) are contained by the
//! pipeline and never change the task's terminal status.

use std::future::Future;

use async_trait::async_trait;

use super::notifier::NotifyError;
use crate::domain::callback::FailureContext;

#[derive(Debug, thiserror::Error)]
pub enum CallbackError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Notify(#[from] NotifyError),
}

#[async_trait]
pub trait FailureCallback: Send + Sync {
    async fn on_failure(&self, ctx: &FailureContext) -> Result<(), CallbackError>;
}

/// Async closure adapter, see [`callback_fn`].
pub struct FnCallback<F>(F);

/// Wrap an async closure as a [`FailureCallback`].
pub fn callback_fn<F, Fut>(f: F) -> FnCallback<F>
where
    F: Fn(FailureContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    FnCallback(f)
}

#[async_trait]
impl<F, Fut> FailureCallback for FnCallback<F>
where
    F: Fn(FailureContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    async fn on_failure(&self, ctx: &FailureContext) -> Result<(), CallbackError> {
        (self.0)(ctx.clone()).await
    }
}

/// Sync closure adapter, see [`sync_callback_fn`].
pub struct SyncFnCallback<F>(F);

/// Wrap a plain closure as a [`FailureCallback`].
pub fn sync_callback_fn<F>(f: F) -> SyncFnCallback<F>
where
    F: Fn(&FailureContext) -> Result<(), CallbackError> + Send + Sync,
{
    SyncFnCallback(f)
}

#[async_trait]
impl<F> FailureCallback for SyncFnCallback<F>
where
    F: Fn(&FailureContext) -> Result<(), CallbackError> + Send + Sync,
{
    async fn on_failure(&self, ctx: &FailureContext) -> Result<(), CallbackError> {
        (self.0)(ctx)
    }
}
