//! ReaperLoop - TTL を過ぎたタスクの回収
//!
//! # フロー
//! 1. interval ごとに `sweep()`
//! 2. `now - created_at > ttl` のレコードを `delete_if` で削除（ログを残す）
//! 3. sweep が失敗したらログを残し、短い retry_interval 後にやり直す
//!
//! 停止は `watch` チャネル（`ReaperHandle::shutdown_and_join`）。

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::domain::task::TaskRecord;
use crate::ports::task_store::{StoreError, TaskStore};
use crate::ports::Clock;

/// Periodic eviction of expired task records.
#[derive(Clone)]
pub struct ReaperLoop {
    store: Arc<dyn TaskStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    interval: Duration,
    retry_interval: Duration,
}

impl ReaperLoop {
    pub fn new(
        store: Arc<dyn TaskStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        interval: Duration,
        retry_interval: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            ttl,
            interval,
            retry_interval,
        }
    }

    /// Delete every record older than the TTL; returns how many were evicted.
    pub fn sweep(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let ttl = self.ttl;
        let expired = move |record: &TaskRecord| record.is_expired_at(now, ttl);

        let mut evicted = 0;
        for record in self.store.list(&expired)? {
            // re-checked under the write lock
            if let Some(removed) = self.store.delete_if(record.id, &expired)? {
                tracing::info!(
                    task_id = %removed.id,
                    kind = %removed.kind,
                    status = %removed.status(),
                    "evicted expired task"
                );
                evicted += 1;
            }
        }
        Ok(evicted)
    }

    /// Start the loop on `handle`.
    pub fn spawn(self, handle: &Handle) -> ReaperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = handle.spawn(async move {
            self.run(shutdown_rx).await;
        });
        ReaperHandle { shutdown_tx, join }
    }

    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        tracing::info!(
            ttl_ms = self.ttl.as_millis() as u64,
            interval_ms = self.interval.as_millis() as u64,
            "expiration reaper started"
        );
        let mut wait = self.interval;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    // sender dropped counts as shutdown
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            wait = match self.sweep() {
                Ok(0) => self.interval,
                Ok(evicted) => {
                    tracing::info!(evicted, "expiration sweep finished");
                    self.interval
                }
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        retry_in_ms = self.retry_interval.as_millis() as u64,
                        "expiration sweep failed"
                    );
                    self.retry_interval
                }
            };
        }
        tracing::info!("expiration reaper stopped");
    }
}

/// Handle of a running reaper.
pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperHandle {
    pub fn request_shutdown(&self) {
        // receiver may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "expiration reaper task ended abnormally");
        }
    }
}
