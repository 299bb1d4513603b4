//! NotificationSender that only logs.

use async_trait::async_trait;

use crate::ports::notifier::{NotificationSender, NotifyError};

/// Default sender: writes what would have been sent to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl NotificationSender for LogNotifier {
    async fn send(&self, destination: &str, message: &str) -> Result<(), NotifyError> {
        tracing::info!(destination, "would send notification: {message}");
        Ok(())
    }
}
