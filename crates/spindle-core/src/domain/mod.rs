//! Domain model (ids, task records, callback configuration, views, errors).

pub mod callback;
pub mod errors;
pub mod ids;
pub mod task;
pub mod view;

pub use self::callback::{CallbackConfig, CallbackStep, FailureContext};
pub use self::errors::EngineError;
pub use self::ids::TaskId;
pub use self::task::{FailureInfo, TaskKind, TaskOutcome, TaskRecord, TaskStatus, TransitionError};
pub use self::view::{ResultBody, ResultView, StatusView, TaskStats};
