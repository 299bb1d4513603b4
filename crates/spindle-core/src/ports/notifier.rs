//! NotificationSender port - 失敗通知の送信先（メール、Webhook など）
//!
//! 既定の実装は `impls::LogNotifier`（ログに出すだけ）。

use async_trait::async_trait;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("notification to {destination} rejected: {reason}")]
    Rejected { destination: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, destination: &str, message: &str) -> Result<(), NotifyError>;
}
