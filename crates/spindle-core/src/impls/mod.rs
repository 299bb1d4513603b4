//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore**: 既定の TaskStore（プロセス内のみ、永続化なし）
//! - **LogNotifier**: 既定の NotificationSender（ログに出すだけ）

pub mod inmem_store;
pub mod log_notifier;

pub use self::inmem_store::InMemoryTaskStore;
pub use self::log_notifier::LogNotifier;
