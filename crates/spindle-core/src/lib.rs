//! spindle-core
//!
//! In-process asynchronous task execution engine: bounded concurrency,
//! lifecycle tracking, cooperative cancellation, failure callbacks and
//! TTL-based eviction.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task record, callback config, views, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, WorkFunction, FailureCallback, Clock, など）
//! - **app**: エンジン本体（builder, manager, executor, limiter, callbacks, reaper）
//! - **impls**: ports の実装（InMemoryTaskStore, LogNotifier）
//! - **config**: `spindle.toml` の読み込み
//!
//! # 使用例
//! ```ignore
//! let manager = EngineBuilder::new(work_fn(|kind, input, _ctx| async move {
//!     Ok(serde_json::json!({ "kind": kind.as_str(), "echo": input }))
//! }))
//! .build()?;
//! manager.start()?;
//!
//! let id = manager.submit("echo", serde_json::json!({"text": "hi"}), SubmitOptions::new())?;
//! let view = manager.status(id)?;
//! ```

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use self::app::{BuildError, EngineBuilder, SubmitOptions, TaskManager};
pub use self::config::{CallbackSettings, ConfigError, EngineConfig};
pub use self::domain::{
    CallbackConfig, EngineError, FailureContext, ResultBody, ResultView, StatusView, TaskId,
    TaskKind, TaskStats, TaskStatus,
};
pub use self::ports::{
    CallbackError, FailureCallback, NotificationSender, NotifyError, WorkContext, WorkError,
    WorkFunction, callback_fn, sync_callback_fn, work_fn,
};
