//! TaskManager - エンジンの公開 API
//!
//! # 設計原則
//! - `submit` は同時実行数を待たない（Pending を作って spawn するだけ）
//! - 読み取り系（status / result / list / stats）は await しない
//! - TTL 切れは読み取り時（status / result / list / stats）にも判定し、
//!   `compare_and_swap` で Expired を書き戻す
//!   （Executor の書き込みと競合したら Executor が勝つ）

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;

use super::callbacks::pipeline::invoke;
use super::executor::{CANCELLED_BY_USER_MESSAGE, TaskExecutor};
use super::reaper_loop::{ReaperHandle, ReaperLoop};
use crate::config::{EngineConfig, MAX_RETRIES_LIMIT};
use crate::domain::callback::{CallbackConfig, FailureContext};
use crate::domain::errors::EngineError;
use crate::domain::ids::TaskId;
use crate::domain::task::{FailureInfo, TaskKind, TaskRecord, TaskStatus};
use crate::domain::view::{ResultView, StatusView, TaskStats};
use crate::ports::failure_callback::FailureCallback;
use crate::ports::task_store::{StoreError, TaskStore};
use crate::ports::work::{CancelHandle, cancel_pair};
use crate::ports::{Clock, IdGenerator};

// lazy expiry retries when an executor write keeps winning the race
const EXPIRY_CAS_ATTEMPTS: usize = 3;

/// Per-submission options.
#[derive(Clone, Default)]
pub struct SubmitOptions {
    /// Falls back to `EngineConfig::default_max_retries`.
    pub max_retries: Option<u32>,
    /// How many times the caller has already resubmitted this work.
    pub retry_count: u32,
    pub callbacks: Option<CallbackConfig>,
    /// Runs after every other failure callback.
    pub on_failure: Option<Arc<dyn FailureCallback>>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    pub fn callbacks(mut self, callbacks: CallbackConfig) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn on_failure(mut self, callback: Arc<dyn FailureCallback>) -> Self {
        self.on_failure = Some(callback);
        self
    }
}

impl std::fmt::Debug for SubmitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubmitOptions")
            .field("max_retries", &self.max_retries)
            .field("retry_count", &self.retry_count)
            .field("callbacks", &self.callbacks)
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// Handle to a running engine. Clones share the same engine.
///
/// Built by [`EngineBuilder`](super::EngineBuilder). The expiration reaper is
/// not running until [`start`](Self::start) is called.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    executor: TaskExecutor,
    runtime: Handle,
    config: EngineConfig,
    cancels: Mutex<HashMap<TaskId, CancelHandle>>,
    reaper: Mutex<Option<ReaperHandle>>,
    closed: AtomicBool,
}

impl Inner {
    fn cancels(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, CancelHandle>> {
        self.cancels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskManager {
    pub(crate) fn from_parts(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        executor: TaskExecutor,
        runtime: Handle,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                clock,
                ids,
                executor,
                runtime,
                config,
                cancels: Mutex::new(HashMap::new()),
                reaper: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.executor.limiter().max_concurrent()
    }

    /// Create a Pending task and schedule it. Never waits for a free slot.
    pub fn submit(
        &self,
        kind: impl Into<TaskKind>,
        input: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<TaskId, EngineError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        let max_retries = options
            .max_retries
            .unwrap_or(inner.config.default_max_retries);
        if max_retries > MAX_RETRIES_LIMIT {
            return Err(EngineError::InvalidOptions(format!(
                "max_retries must be at most {MAX_RETRIES_LIMIT}, got {max_retries}"
            )));
        }

        let id = inner.ids.generate_task_id();
        let record = TaskRecord::new(id, kind.into(), input, inner.clock.now())
            .with_retries(options.retry_count, max_retries)
            .with_callbacks(options.callbacks);
        let kind = record.kind.clone();
        inner.store.insert(record)?;

        let (cancel, signal) = cancel_pair();
        inner.cancels().insert(id, cancel);

        let task_inner = Arc::clone(inner);
        let on_failure = options.on_failure;
        inner.runtime.spawn(async move {
            task_inner.executor.execute(id, signal, on_failure).await;
            task_inner.cancels().remove(&id);
        });

        tracing::info!(task_id = %id, kind = %kind, "task submitted");
        Ok(id)
    }

    /// Current status; an expired task is reported as not found.
    pub fn status(&self, id: TaskId) -> Result<StatusView, EngineError> {
        self.load_live(id).map(|record| StatusView::from(&record))
    }

    /// Result, error message or progress, depending on the status.
    pub fn result(&self, id: TaskId) -> Result<ResultView, EngineError> {
        self.load_live(id).map(|record| ResultView::from(&record))
    }

    /// Request cancellation.
    ///
    /// Returns `false` if the task is unknown or already terminal. The record
    /// is Failed when this returns `true`; the work itself stops at its next
    /// await point.
    pub fn cancel(&self, id: TaskId) -> bool {
        let inner = &self.inner;
        match self.load_live(id) {
            Ok(record) if !record.status().is_terminal() => {}
            _ => return false,
        }

        let now = inner.clock.now();
        let cancelled = inner.store.modify(id, &mut |record| {
            record.fail(FailureInfo::new(CANCELLED_BY_USER_MESSAGE), now)
        });
        match cancelled {
            Ok(_) => {
                if let Some(handle) = inner.cancels().get(&id) {
                    handle.cancel();
                }
                tracing::info!(task_id = %id, "task cancelled");
                true
            }
            Err(StoreError::Transition(_) | StoreError::NotFound(_)) => false,
            Err(err) => {
                tracing::error!(task_id = %id, error = %err, "failed to cancel task");
                false
            }
        }
    }

    /// Tasks newest first.
    ///
    /// Without a filter expired tasks are left out. `limit == 0` means no limit.
    pub fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<StatusView>, EngineError> {
        let limit = if limit == 0 { usize::MAX } else { limit };
        let views = self
            .settled_records()?
            .into_iter()
            .filter(|record| match status {
                Some(wanted) => record.status() == wanted,
                None => record.status() != TaskStatus::Expired,
            })
            .take(limit)
            .map(|record| StatusView::from(&record))
            .collect();
        Ok(views)
    }

    pub fn stats(&self) -> Result<TaskStats, EngineError> {
        let records = self.settled_records()?;
        Ok(TaskStats::from_records(&records, self.max_concurrent()))
    }

    /// Register (or replace) a named callback usable as `custom_callback_name`.
    pub fn register_callback(&self, name: impl Into<String>, callback: Arc<dyn FailureCallback>) {
        self.inner.executor.pipeline().registry().register(name, callback);
    }

    pub fn list_callback_names(&self) -> Vec<String> {
        self.inner.executor.pipeline().registry().list_names()
    }

    /// Callback run for every failed task, after its configured steps.
    pub fn add_global_callback(&self, name: impl Into<String>, callback: Arc<dyn FailureCallback>) {
        self.inner.executor.pipeline().add_global(name, callback);
    }

    pub fn remove_global_callback(&self, name: &str) -> bool {
        self.inner.executor.pipeline().remove_global(name)
    }

    /// Invoke a registered callback once with a synthetic failure.
    ///
    /// Returns whether the callback succeeded.
    pub async fn test_callback(&self, name: &str) -> Result<bool, EngineError> {
        let callback = self
            .inner
            .executor
            .pipeline()
            .registry()
            .get(name)
            .ok_or_else(|| EngineError::CallbackNotFound(name.to_string()))?;

        let now = self.inner.clock.now();
        let ctx = FailureContext {
            task_id: self.inner.ids.generate_task_id(),
            kind: TaskKind::new("callback_test"),
            error_message: "synthetic failure for callback test".to_string(),
            stack_trace: None,
            retry_count: 0,
            max_retries: self.inner.config.default_max_retries,
            input: serde_json::json!({ "test": true }),
            created_at: now,
            failed_at: now,
        };
        Ok(invoke(name, callback.as_ref(), &ctx).await)
    }

    /// Start the expiration reaper on the engine's runtime.
    pub fn start(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        let mut reaper = inner.reaper.lock().unwrap_or_else(PoisonError::into_inner);
        if reaper.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(EngineError::AlreadyStarted);
        }
        let reaper_loop = ReaperLoop::new(
            Arc::clone(&inner.store),
            Arc::clone(&inner.clock),
            inner.config.ttl(),
            inner.config.reaper_interval(),
            inner.config.reaper_retry(),
        );
        *reaper = Some(reaper_loop.spawn(&inner.runtime));
        Ok(())
    }

    /// Stop the expiration reaper. Running tasks are left alone.
    pub async fn stop(&self) {
        let handle = self
            .inner
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.shutdown_and_join().await;
        }
    }

    /// Stop the reaper, refuse new submissions and cancel in-flight work.
    ///
    /// Tasks that are still Pending or Running end up Failed with
    /// "task was cancelled". Records stay queryable.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.stop().await;
        self.inner.executor.limiter().close();

        let handles: Vec<CancelHandle> = self.inner.cancels().values().cloned().collect();
        tracing::info!(in_flight = handles.len(), "engine shutting down");
        for handle in handles {
            handle.cancel();
        }
    }

    /// Load a record, applying the TTL check with write-back.
    fn load_live(&self, id: TaskId) -> Result<TaskRecord, EngineError> {
        let record = self
            .inner
            .store
            .get(id)?
            .ok_or(EngineError::NotFound(id))?;
        match self.settle_expiry(record)? {
            Some(record) if record.status() != TaskStatus::Expired => Ok(record),
            _ => Err(EngineError::NotFound(id)),
        }
    }

    /// Every stored record after the TTL check, newest first.
    fn settled_records(&self) -> Result<Vec<TaskRecord>, EngineError> {
        let mut records = Vec::new();
        for record in self.inner.store.list(&|_| true)? {
            if let Some(record) = self.settle_expiry(record)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Write `Expired` back if `record` is past its TTL.
    ///
    /// Returns the record as stored afterwards, or `None` if it was evicted
    /// in the meantime. When an executor write lands first the record is
    /// re-read and checked again.
    fn settle_expiry(&self, mut record: TaskRecord) -> Result<Option<TaskRecord>, EngineError> {
        let inner = &self.inner;
        for _ in 0..EXPIRY_CAS_ATTEMPTS {
            let now = inner.clock.now();
            if record.status() == TaskStatus::Expired
                || !record.is_expired_at(now, inner.config.ttl())
            {
                return Ok(Some(record));
            }

            let id = record.id;
            let mut expired = record.clone();
            expired.expire(now).map_err(StoreError::from)?;
            match inner.store.compare_and_swap(id, record.version(), expired.clone()) {
                Ok(()) => {
                    tracing::debug!(task_id = %id, "task expired on read");
                    return Ok(Some(expired));
                }
                Err(StoreError::VersionConflict { .. }) => match inner.store.get(id)? {
                    Some(current) => record = current,
                    None => return Ok(None),
                },
                Err(StoreError::NotFound(_)) => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
        // still racing with a busy writer; the next read tries again
        Ok(Some(record))
    }
}
