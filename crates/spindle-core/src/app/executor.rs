//! TaskExecutor - 1 タスクを permit 取得から終端状態まで進める
//!
//! # フロー
//! 1. ConcurrencyLimiter の permit を待つ（cancel と競合）
//! 2. Pending -> Running（progress = 10）
//! 3. work function を await（cancel と競合、panic も捕捉）
//! 4. Completed / Failed を書く（終端済みなら捨てる）
//! 5. permit を返す（終端状態を書いた後。Running 数が上限を超えない）
//! 6. 最終状態が Failed なら FailurePipeline を 1 回だけ実行
//!
//! 書き込みは全て `TaskStore::modify` 経由で遷移チェック付き。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use super::callbacks::{FailurePipeline, PipelineReport};
use super::limiter::{ConcurrencyLimiter, Permit};
use super::panic_message;
use crate::domain::callback::FailureContext;
use crate::domain::ids::TaskId;
use crate::domain::task::FailureInfo;
use crate::ports::failure_callback::FailureCallback;
use crate::ports::task_store::{StoreError, TaskStore};
use crate::ports::work::{CancelSignal, ProgressReporter, WorkContext, WorkFunction};
use crate::ports::Clock;

/// Error message written when the executor observes cancellation itself.
pub const CANCELLED_MESSAGE: &str = "task was cancelled";

/// Error message written by [`TaskManager::cancel`](super::TaskManager::cancel).
pub const CANCELLED_BY_USER_MESSAGE: &str = "cancelled by user";

/// What came out of one execution attempt.
#[derive(Debug)]
enum WorkOutcome {
    Completed(serde_json::Value),
    Failed(FailureInfo),
    Cancelled,
    /// Never reached Running (already terminal or evicted).
    NotStarted,
}

/// Drives single tasks through their lifecycle.
///
/// Cheap to clone; every spawned task gets its own copy.
#[derive(Clone)]
pub struct TaskExecutor {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    limiter: ConcurrencyLimiter,
    pipeline: Arc<FailurePipeline>,
    work: Arc<dyn WorkFunction>,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        limiter: ConcurrencyLimiter,
        pipeline: Arc<FailurePipeline>,
        work: Arc<dyn WorkFunction>,
    ) -> Self {
        Self {
            store,
            clock,
            limiter,
            pipeline,
            work,
        }
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    pub fn pipeline(&self) -> &Arc<FailurePipeline> {
        &self.pipeline
    }

    /// Run task `id` to a terminal state.
    ///
    /// Returns the failure pipeline report if the task ended up Failed.
    pub async fn execute(
        &self,
        id: TaskId,
        mut cancel: CancelSignal,
        task_callback: Option<Arc<dyn FailureCallback>>,
    ) -> Option<PipelineReport> {
        let (outcome, permit) = self.run_work(id, &mut cancel).await;
        self.record_outcome(id, outcome);
        // the slot is only free once the record has left Running
        drop(permit);
        self.run_failure_pipeline(id, task_callback.as_ref()).await
    }

    /// Returns the outcome together with the permit it ran under, if any.
    async fn run_work(
        &self,
        id: TaskId,
        cancel: &mut CancelSignal,
    ) -> (WorkOutcome, Option<Permit>) {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return (WorkOutcome::Cancelled, None),
            permit = self.limiter.acquire() => match permit {
                Ok(permit) => permit,
                // closed on engine shutdown
                Err(_) => return (WorkOutcome::Cancelled, None),
            },
        };

        let now = self.clock.now();
        let record = match self.store.modify(id, &mut |record| record.start(now)) {
            Ok(record) => record,
            Err(err) => {
                tracing::debug!(task_id = %id, error = %err, "task not started");
                return (WorkOutcome::NotStarted, None);
            }
        };
        tracing::info!(task_id = %id, kind = %record.kind, "task started");

        let ctx = WorkContext {
            task_id: id,
            cancel: cancel.clone(),
            progress: ProgressReporter::new(id, Arc::clone(&self.store), Arc::clone(&self.clock)),
        };
        let work = AssertUnwindSafe(self.work.run(&record.kind, record.input.clone(), ctx))
            .catch_unwind();

        // dropping the work future at its next await point is the cancellation
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => WorkOutcome::Cancelled,
            res = work => match res {
                Ok(Ok(value)) => WorkOutcome::Completed(value),
                Ok(Err(err)) => {
                    let mut info = FailureInfo::new(err.to_string());
                    if let Some(trace) = err.stack_trace() {
                        info = info.with_stack_trace(trace);
                    }
                    WorkOutcome::Failed(info)
                }
                Err(panic) => WorkOutcome::Failed(FailureInfo::new(format!(
                    "work function panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            },
        };
        (outcome, Some(permit))
    }

    fn record_outcome(&self, id: TaskId, outcome: WorkOutcome) {
        let now = self.clock.now();
        let written = match outcome {
            WorkOutcome::NotStarted => return,
            WorkOutcome::Completed(value) => {
                self.store.modify(id, &mut |record| record.complete(value.clone(), now))
            }
            WorkOutcome::Failed(info) => {
                self.store.modify(id, &mut |record| record.fail(info.clone(), now))
            }
            WorkOutcome::Cancelled => self.store.modify(id, &mut |record| {
                record.fail(FailureInfo::new(CANCELLED_MESSAGE), now)
            }),
        };

        match written {
            Ok(record) => tracing::info!(
                task_id = %id,
                kind = %record.kind,
                status = %record.status(),
                "task finished"
            ),
            // cancelled or expired in the meantime; the earlier write wins
            Err(StoreError::Transition(err)) => tracing::debug!(
                task_id = %id,
                current = %err.from,
                discarded = %err.to,
                "discarding late task outcome"
            ),
            Err(StoreError::NotFound(_)) => {
                tracing::debug!(task_id = %id, "task evicted before its outcome was recorded")
            }
            Err(err) => tracing::error!(task_id = %id, error = %err, "failed to record task outcome"),
        }
    }

    async fn run_failure_pipeline(
        &self,
        id: TaskId,
        task_callback: Option<&Arc<dyn FailureCallback>>,
    ) -> Option<PipelineReport> {
        let record = match self.store.get(id) {
            Ok(record) => record?,
            Err(err) => {
                tracing::error!(task_id = %id, error = %err, "failed to load task for failure callbacks");
                return None;
            }
        };
        let ctx = FailureContext::from_record(&record)?;
        Some(
            self.pipeline
                .run(&ctx, record.callbacks.as_ref(), task_callback)
                .await,
        )
    }
}
