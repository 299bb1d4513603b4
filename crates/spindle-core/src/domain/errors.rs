//! Errors surfaced by the facade.

use thiserror::Error;

use super::ids::TaskId;
use crate::ports::task_store::StoreError;

/// EngineError は TaskManager の呼び出し元に返すエラー
///
/// Failures inside the execution path (work function, callbacks, reaper
/// sweeps) never show up here; they are recorded as task state and logs.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("invalid submit options: {0}")]
    InvalidOptions(String),

    #[error("callback not found: {0}")]
    CallbackNotFound(String),

    #[error("expiration reaper is already running")]
    AlreadyStarted,

    #[error("engine is shut down")]
    ShutDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound(_) | EngineError::Store(StoreError::NotFound(_))
        )
    }
}
