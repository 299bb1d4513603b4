//! TaskStore port - TaskRecord の正本（source of truth）
//!
//! すべての操作は 1 レコード単位の point operation。
//! 実装はロックを保持したまま await しないこと（trait は同期）。

use thiserror::Error;

use crate::domain::ids::TaskId;
use crate::domain::task::{TaskRecord, TransitionError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("task id already in use: {0}")]
    DuplicateId(TaskId),

    #[error("version conflict for {id}: expected {expected}, found {actual}")]
    VersionConflict {
        id: TaskId,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("task store lock poisoned")]
    Poisoned,
}

/// Filter applied by [`TaskStore::list`].
pub type RecordFilter<'a> = &'a (dyn Fn(&TaskRecord) -> bool + Sync);

/// TaskStore は全タスクの状態を保持
///
/// # 設計原則
/// - `modify` のクロージャは 1 レコードのクリティカルセクション内で走る
/// - `compare_and_swap` は `version` が変わっていなければ差し替える
/// - `list` は created_at 降順（同時刻は id 降順）で決定的
pub trait TaskStore: Send + Sync {
    /// Insert a new record. Fails if the id is already present.
    fn insert(&self, record: TaskRecord) -> Result<(), StoreError>;

    fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    fn delete(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    /// Delete only if `predicate` still holds for the current record.
    fn delete_if(
        &self,
        id: TaskId,
        predicate: RecordFilter<'_>,
    ) -> Result<Option<TaskRecord>, StoreError>;

    /// Records matching `filter`, newest first.
    fn list(&self, filter: RecordFilter<'_>) -> Result<Vec<TaskRecord>, StoreError>;

    /// Apply `apply` to the record in place and return the updated copy.
    ///
    /// If `apply` fails the record is left untouched.
    fn modify(
        &self,
        id: TaskId,
        apply: &mut dyn FnMut(&mut TaskRecord) -> Result<(), TransitionError>,
    ) -> Result<TaskRecord, StoreError>;

    /// Replace the record if its version still equals `expected_version`.
    fn compare_and_swap(
        &self,
        id: TaskId,
        expected_version: u64,
        record: TaskRecord,
    ) -> Result<(), StoreError>;

    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}
