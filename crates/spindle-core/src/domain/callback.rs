//! Failure callback configuration and context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::task::{TaskKind, TaskRecord};

/// Per-task configuration of the failure pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallbackConfig {
    pub save_failure_details: bool,
    pub enable_notifications: bool,
    pub cleanup: bool,
    pub custom_callback_name: Option<String>,
    pub notification_email: Option<String>,
}

impl Default for CallbackConfig {
    fn default() -> Self {
        Self {
            save_failure_details: true,
            enable_notifications: false,
            cleanup: true,
            custom_callback_name: None,
            notification_email: None,
        }
    }
}

impl CallbackConfig {
    /// Everything off; only the mandatory log step remains.
    pub fn log_only() -> Self {
        Self {
            save_failure_details: false,
            enable_notifications: false,
            cleanup: false,
            custom_callback_name: None,
            notification_email: None,
        }
    }

    /// Compile the flags into the ordered step list.
    ///
    /// Order: log, persist, notify, cleanup, custom, email.
    pub fn steps(&self) -> Vec<CallbackStep> {
        let mut steps = vec![CallbackStep::Log];
        if self.save_failure_details {
            steps.push(CallbackStep::PersistDetails);
        }
        if self.enable_notifications {
            steps.push(CallbackStep::Notify);
        }
        if self.cleanup {
            steps.push(CallbackStep::Cleanup);
        }
        if let Some(name) = &self.custom_callback_name {
            steps.push(CallbackStep::Custom(name.clone()));
        }
        if let Some(email) = &self.notification_email {
            steps.push(CallbackStep::Email(email.clone()));
        }
        steps
    }
}

/// One step of a compiled failure pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackStep {
    Log,
    PersistDetails,
    Notify,
    Cleanup,
    /// Registry lookup by name.
    Custom(String),
    /// Email notification composed for this destination only.
    Email(String),
}

impl CallbackStep {
    /// Name used in logs when the step fails.
    pub fn label(&self) -> String {
        match self {
            CallbackStep::Log => "log_failure".to_string(),
            CallbackStep::PersistDetails => "save_failure_details".to_string(),
            CallbackStep::Notify => "send_notification".to_string(),
            CallbackStep::Cleanup => "cleanup_task_data".to_string(),
            CallbackStep::Custom(name) => name.clone(),
            CallbackStep::Email(address) => format!("email_notification:{address}"),
        }
    }
}

/// Everything a failure callback gets to see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureContext {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub input: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub failed_at: DateTime<Utc>,
}

impl FailureContext {
    /// Build the context of a failed record. `None` unless the record is Failed.
    pub fn from_record(record: &TaskRecord) -> Option<Self> {
        let failure = record.failure()?;
        Some(Self {
            task_id: record.id,
            kind: record.kind.clone(),
            error_message: failure.message.clone(),
            stack_trace: failure.stack_trace.clone(),
            retry_count: record.retry_count,
            max_retries: record.max_retries,
            input: record.input.clone(),
            created_at: record.created_at,
            failed_at: record.updated_at(),
        })
    }

    /// Has this task used up its retry budget?
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Human-readable notification body shared by the notify and email steps.
    pub fn notification_message(&self) -> String {
        format!(
            "Task failure notification\n\
             Task ID: {}\n\
             Task kind: {}\n\
             Error: {}\n\
             Retries: {}/{}\n\
             Failed at: {}",
            self.task_id,
            self.kind,
            self.error_message,
            self.retry_count,
            self.max_retries,
            self.failed_at.to_rfc3339(),
        )
    }
}
