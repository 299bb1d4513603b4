//! Failure callbacks: named registry, built-ins and the per-failure pipeline.

pub mod builtin;
pub mod pipeline;
pub mod registry;

pub use self::builtin::{
    CLEANUP_TASK_DATA, CleanupTaskData, KindFailureStats, LOG_FAILURE, LogFailure,
    SAVE_FAILURE_DETAILS, SEND_NOTIFICATION, SaveFailureDetails, SendNotification,
};
pub use self::pipeline::{FailurePipeline, PipelineReport};
pub use self::registry::CallbackRegistry;
