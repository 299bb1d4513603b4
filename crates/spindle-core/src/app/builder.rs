//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! グローバルな singleton は持たない。組み込む側が 1 回 build して、
//! できた `TaskManager`（clone 可能なハンドル）を配って使う。
//!
//! # Fail-fast 設計
//! - build() 時に config を検証
//! - tokio runtime が無ければ BuildError::NoRuntime

use std::sync::Arc;

use tokio::runtime::Handle;

use super::callbacks::FailurePipeline;
use super::executor::TaskExecutor;
use super::limiter::ConcurrencyLimiter;
use super::manager::TaskManager;
use crate::config::{ConfigError, EngineConfig};
use crate::impls::{InMemoryTaskStore, LogNotifier};
use crate::ports::{
    Clock, IdGenerator, NotificationSender, SystemClock, TaskStore, UlidGenerator, WorkFunction,
};

/// BuildError はエンジン構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("no tokio runtime: build inside a runtime or pass one with EngineBuilder::runtime")]
    NoRuntime,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// EngineBuilder は TaskManager を構築
///
/// # 使用例
/// ```ignore
/// let manager = EngineBuilder::new(work_fn(|kind, input, _ctx| async move { Ok(input) }))
///     .config(EngineConfig::load("spindle.toml")?)
///     .build()?;
/// manager.start()?;
/// ```
///
/// 省略したものは既定値: SystemClock, UlidGenerator, InMemoryTaskStore, LogNotifier,
/// 現在の tokio runtime。
pub struct EngineBuilder {
    work: Arc<dyn WorkFunction>,
    config: EngineConfig,
    notifier: Option<Arc<dyn NotificationSender>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    store: Option<Arc<dyn TaskStore>>,
    runtime: Option<Handle>,
}

impl EngineBuilder {
    pub fn new(work: impl WorkFunction + 'static) -> Self {
        Self::with_shared_work(Arc::new(work))
    }

    pub fn with_shared_work(work: Arc<dyn WorkFunction>) -> Self {
        Self {
            work,
            config: EngineConfig::default(),
            notifier: None,
            clock: None,
            ids: None,
            store: None,
            runtime: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn notifier(mut self, notifier: impl NotificationSender + 'static) -> Self {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Runtime that task bodies and the reaper are spawned on.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<TaskManager, BuildError> {
        self.config.validate()?;
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| BuildError::NoRuntime)?,
        };

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let notifier = self.notifier.unwrap_or_else(|| Arc::new(LogNotifier));

        let limiter = ConcurrencyLimiter::new(self.config.max_concurrent)
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        let pipeline = Arc::new(FailurePipeline::new(&self.config.callbacks, notifier));
        let executor = TaskExecutor::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            limiter,
            pipeline,
            self.work,
        );

        tracing::info!(
            max_concurrent = self.config.max_concurrent,
            task_ttl_ms = self.config.task_ttl_ms,
            "task engine built"
        );
        Ok(TaskManager::from_parts(
            store,
            clock,
            ids,
            executor,
            runtime,
            self.config,
        ))
    }
}
