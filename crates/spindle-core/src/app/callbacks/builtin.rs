//! Built-in failure callbacks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::domain::callback::FailureContext;
use crate::ports::failure_callback::{CallbackError, FailureCallback};
use crate::ports::notifier::NotificationSender;

pub const LOG_FAILURE: &str = "log_failure";
pub const SAVE_FAILURE_DETAILS: &str = "save_failure_details";
pub const SEND_NOTIFICATION: &str = "send_notification";
pub const CLEANUP_TASK_DATA: &str = "cleanup_task_data";

/// Mandatory first step of every failure pipeline.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFailure;

#[async_trait]
impl FailureCallback for LogFailure {
    async fn on_failure(&self, ctx: &FailureContext) -> Result<(), CallbackError> {
        tracing::error!(
            task_id = %ctx.task_id,
            kind = %ctx.kind,
            retry_count = ctx.retry_count,
            max_retries = ctx.max_retries,
            "task failed: {}",
            ctx.error_message
        );
        if let Some(trace) = &ctx.stack_trace {
            tracing::debug!(task_id = %ctx.task_id, "{trace}");
        }
        Ok(())
    }
}

/// Writes the failure context as pretty JSON under `dir`.
#[derive(Debug, Clone)]
pub struct SaveFailureDetails {
    dir: PathBuf,
}

impl SaveFailureDetails {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<dir>/task_failure_<id>_<YYYYmmdd_HHMMSS>.json`
    pub fn path_for(&self, ctx: &FailureContext) -> PathBuf {
        self.dir.join(format!(
            "task_failure_{}_{}.json",
            ctx.task_id,
            ctx.failed_at.format("%Y%m%d_%H%M%S")
        ))
    }
}

#[async_trait]
impl FailureCallback for SaveFailureDetails {
    async fn on_failure(&self, ctx: &FailureContext) -> Result<(), CallbackError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(ctx);
        let body = serde_json::to_vec_pretty(ctx)?;
        tokio::fs::write(&path, body).await?;
        tracing::info!(task_id = %ctx.task_id, path = %path.display(), "saved failure details");
        Ok(())
    }
}

/// Sends the standard notification body to one destination.
///
/// Used both for the configured default destination (`send_notification`)
/// and for per-task email addresses.
#[derive(Clone)]
pub struct SendNotification {
    notifier: Arc<dyn NotificationSender>,
    destination: String,
}

impl SendNotification {
    pub fn new(notifier: Arc<dyn NotificationSender>, destination: impl Into<String>) -> Self {
        Self {
            notifier,
            destination: destination.into(),
        }
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }
}

#[async_trait]
impl FailureCallback for SendNotification {
    async fn on_failure(&self, ctx: &FailureContext) -> Result<(), CallbackError> {
        self.notifier
            .send(&self.destination, &ctx.notification_message())
            .await?;
        Ok(())
    }
}

/// Entry of the per-kind failure counter file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindFailureStats {
    pub total_failures: u64,
    pub last_failure: Option<DateTime<Utc>>,
}

/// Once retries are exhausted: drop the task's scratch directory and
/// bump its kind's failure counter.
#[derive(Debug, Clone)]
pub struct CleanupTaskData {
    scratch_dir: PathBuf,
    stats_file: PathBuf,
    // read-modify-write of the stats file
    stats_lock: Arc<Mutex<()>>,
}

impl CleanupTaskData {
    pub fn new(scratch_dir: impl Into<PathBuf>, stats_file: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
            stats_file: stats_file.into(),
            stats_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn scratch_dir_for(&self, ctx: &FailureContext) -> PathBuf {
        self.scratch_dir.join(format!("task_{}", ctx.task_id))
    }

    async fn bump_stats(&self, ctx: &FailureContext) -> Result<(), CallbackError> {
        let _guard = self.stats_lock.lock().await;

        let mut stats = read_stats(&self.stats_file).await?;
        let entry = stats
            .entry(ctx.kind.as_str().to_string())
            .or_insert(KindFailureStats {
                total_failures: 0,
                last_failure: None,
            });
        entry.total_failures += 1;
        entry.last_failure = Some(ctx.failed_at);

        if let Some(parent) = self.stats_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.stats_file, serde_json::to_vec_pretty(&stats)?).await?;
        Ok(())
    }
}

/// Current contents of a stats file; a missing file is empty.
pub async fn read_stats(path: &Path) -> Result<BTreeMap<String, KindFailureStats>, CallbackError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(err.into()),
    }
}

#[async_trait]
impl FailureCallback for CleanupTaskData {
    async fn on_failure(&self, ctx: &FailureContext) -> Result<(), CallbackError> {
        if !ctx.retries_exhausted() {
            tracing::debug!(
                task_id = %ctx.task_id,
                retry_count = ctx.retry_count,
                max_retries = ctx.max_retries,
                "retries left, keeping task data"
            );
            return Ok(());
        }

        let dir = self.scratch_dir_for(ctx);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
            tracing::info!(task_id = %ctx.task_id, path = %dir.display(), "removed task scratch data");
        }

        self.bump_stats(ctx).await
    }
}
