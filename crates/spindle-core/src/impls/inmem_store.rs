//! In-memory TaskStore implementation.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::ids::TaskId;
use crate::domain::task::{TaskRecord, TransitionError};
use crate::ports::task_store::{RecordFilter, StoreError, TaskStore};

/// HashMap behind a `std::sync::RwLock`.
///
/// Every operation takes the lock for one point operation and releases it
/// before returning, so no lock is ever held across an `.await`.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    records: RwLock<HashMap<TaskId, TaskRecord>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<TaskId, TaskRecord>>, StoreError> {
        self.records.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<TaskId, TaskRecord>>, StoreError> {
        self.records.write().map_err(|_| StoreError::Poisoned)
    }
}

impl TaskStore for InMemoryTaskStore {
    fn insert(&self, record: TaskRecord) -> Result<(), StoreError> {
        let mut records = self.write()?;
        if records.contains_key(&record.id) {
            return Err(StoreError::DuplicateId(record.id));
        }
        records.insert(record.id, record);
        Ok(())
    }

    fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn delete(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.write()?.remove(&id))
    }

    fn delete_if(
        &self,
        id: TaskId,
        predicate: RecordFilter<'_>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let mut records = self.write()?;
        match records.get(&id) {
            Some(record) if predicate(record) => Ok(records.remove(&id)),
            _ => Ok(None),
        }
    }

    fn list(&self, filter: RecordFilter<'_>) -> Result<Vec<TaskRecord>, StoreError> {
        let mut matched: Vec<TaskRecord> = self
            .read()?
            .values()
            .filter(|record| filter(record))
            .cloned()
            .collect();
        // newest first; ULID order breaks ties deterministically
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(matched)
    }

    fn modify(
        &self,
        id: TaskId,
        apply: &mut dyn FnMut(&mut TaskRecord) -> Result<(), TransitionError>,
    ) -> Result<TaskRecord, StoreError> {
        let mut records = self.write()?;
        let record = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        // work on a copy so a failed transition leaves the stored record untouched
        let mut updated = record.clone();
        apply(&mut updated)?;
        *record = updated.clone();
        Ok(updated)
    }

    fn compare_and_swap(
        &self,
        id: TaskId,
        expected_version: u64,
        record: TaskRecord,
    ) -> Result<(), StoreError> {
        let mut records = self.write()?;
        let current = records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if current.version() != expected_version {
            return Err(StoreError::VersionConflict {
                id,
                expected: expected_version,
                actual: current.version(),
            });
        }
        *current = record;
        Ok(())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.len())
    }
}
