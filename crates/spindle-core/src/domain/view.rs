//! Read-side views returned by the facade.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ids::TaskId;
use super::task::{TaskKind, TaskRecord, TaskStatus};

/// `{id, status, progress, created_at, updated_at}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusView {
    pub id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub progress: u8,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskRecord> for StatusView {
    fn from(record: &TaskRecord) -> Self {
        Self {
            id: record.id,
            kind: record.kind.clone(),
            status: record.status(),
            progress: record.progress(),
            created_at: record.created_at,
            updated_at: record.updated_at(),
        }
    }
}

/// Status-dependent part of a [`ResultView`].
///
/// Flattened, so it serializes as exactly one of `result`, `error_message`
/// or `progress`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultBody {
    Result(serde_json::Value),
    ErrorMessage(String),
    Progress(u8),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultView {
    pub id: TaskId,
    pub status: TaskStatus,
    #[serde(flatten)]
    pub body: ResultBody,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskRecord> for ResultView {
    fn from(record: &TaskRecord) -> Self {
        let body = match (record.result(), record.error_message()) {
            (Some(value), _) => ResultBody::Result(value.clone()),
            (None, Some(message)) => ResultBody::ErrorMessage(message.to_string()),
            (None, None) => ResultBody::Progress(record.progress()),
        };
        Self {
            id: record.id,
            status: record.status(),
            body,
            created_at: record.created_at,
            updated_at: record.updated_at(),
        }
    }
}

/// Aggregate counts over the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskStats {
    pub total_tasks: usize,
    pub by_status: BTreeMap<TaskStatus, usize>,
    pub by_kind: BTreeMap<String, usize>,
    pub max_concurrent: usize,
    pub active_running: usize,
}

impl TaskStats {
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a TaskRecord>,
        max_concurrent: usize,
    ) -> Self {
        let mut stats = TaskStats {
            max_concurrent,
            ..Default::default()
        };
        for record in records {
            stats.total_tasks += 1;
            *stats.by_status.entry(record.status()).or_default() += 1;
            *stats
                .by_kind
                .entry(record.kind.as_str().to_string())
                .or_default() += 1;
        }
        stats.active_running = stats
            .by_status
            .get(&TaskStatus::Running)
            .copied()
            .unwrap_or(0);
        stats
    }
}
