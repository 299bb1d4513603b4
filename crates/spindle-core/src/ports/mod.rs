//! Ports - 抽象化レイヤー
//!
//! エンジンの外側（実処理、通知先、時刻、ID、保存先）への seam を trait で定義します。
//! 実装は `impls` に置き、テストでは差し替えます。

pub mod clock;
pub mod failure_callback;
pub mod id_generator;
pub mod notifier;
pub mod task_store;
pub mod work;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::failure_callback::{
    CallbackError, FailureCallback, FnCallback, SyncFnCallback, callback_fn, sync_callback_fn,
};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::notifier::{NotificationSender, NotifyError};
pub use self::task_store::{RecordFilter, StoreError, TaskStore};
pub use self::work::{
    CancelHandle, CancelSignal, FnWork, ProgressReporter, WorkContext, WorkError, WorkFunction,
    cancel_pair, work_fn,
};
