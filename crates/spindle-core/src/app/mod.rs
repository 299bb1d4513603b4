//! App - アプリケーション層
//!
//! ports を組み合わせてエンジン本体を組み立てます。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: 依存の注入と TaskManager の構築
//! - **TaskManager**: 公開 API（submit / status / result / cancel / list / stats）
//! - **TaskExecutor**: 1 タスクを permit 取得から終端状態まで進める
//! - **ConcurrencyLimiter**: 同時実行数の上限
//! - **FailurePipeline**: 失敗時 callback の実行
//! - **ReaperLoop**: TTL を過ぎたレコードの回収

pub mod builder;
pub mod callbacks;
pub mod executor;
pub mod limiter;
pub mod manager;
pub mod reaper_loop;

use std::any::Any;

pub use self::builder::{BuildError, EngineBuilder};
pub use self::callbacks::{CallbackRegistry, FailurePipeline, PipelineReport};
pub use self::executor::TaskExecutor;
pub use self::limiter::{ConcurrencyLimiter, LimiterError, Permit};
pub use self::manager::{SubmitOptions, TaskManager};
pub use self::reaper_loop::{ReaperHandle, ReaperLoop};

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
