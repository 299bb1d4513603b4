use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

use futures::FutureExt;

use super::builtin::{
    CLEANUP_TASK_DATA, CleanupTaskData, LOG_FAILURE, LogFailure, SAVE_FAILURE_DETAILS,
    SEND_NOTIFICATION, SaveFailureDetails, SendNotification,
};
use super::registry::CallbackRegistry;
use crate::app::panic_message;
use crate::config::CallbackSettings;
use crate::domain::callback::{CallbackConfig, CallbackStep, FailureContext};
use crate::ports::failure_callback::FailureCallback;
use crate::ports::notifier::NotificationSender;

/// What happened during one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    /// Labels of the callbacks that ran, in order.
    pub invoked: Vec<String>,
    /// Labels of the callbacks that returned an error or panicked.
    pub failed: Vec<String>,
    /// Custom callback names that were not registered.
    pub missing: Vec<String>,
}

/// FailurePipeline runs the failure callbacks of one failed task.
///
/// # 実行順
/// 1. `CallbackConfig` から組み立てた step（無ければ log のみ）
/// 2. global callbacks（登録順）
/// 3. task 固有の callback（最後）
///
/// 各 callback は独立: Err も panic もログに残して次へ進む。
pub struct FailurePipeline {
    registry: Arc<CallbackRegistry>,
    notifier: Arc<dyn NotificationSender>,
    log: Arc<dyn FailureCallback>,
    save: Arc<dyn FailureCallback>,
    notify: Arc<dyn FailureCallback>,
    cleanup: Arc<dyn FailureCallback>,
    globals: RwLock<Vec<(String, Arc<dyn FailureCallback>)>>,
}

impl FailurePipeline {
    /// Build the pipeline and a registry pre-populated with the defaults.
    ///
    /// The built-in steps and their registry entries share one instance each.
    pub fn new(settings: &CallbackSettings, notifier: Arc<dyn NotificationSender>) -> Self {
        let log: Arc<dyn FailureCallback> = Arc::new(LogFailure);
        let save: Arc<dyn FailureCallback> = Arc::new(SaveFailureDetails::new(&settings.failure_dir));
        let notify: Arc<dyn FailureCallback> = Arc::new(SendNotification::new(
            Arc::clone(&notifier),
            settings.notification_destination.clone(),
        ));
        let cleanup: Arc<dyn FailureCallback> = Arc::new(CleanupTaskData::new(
            &settings.scratch_dir,
            &settings.stats_file,
        ));

        let registry = CallbackRegistry::new();
        registry.register(LOG_FAILURE, Arc::clone(&log));
        registry.register(SAVE_FAILURE_DETAILS, Arc::clone(&save));
        registry.register(SEND_NOTIFICATION, Arc::clone(&notify));
        registry.register(CLEANUP_TASK_DATA, Arc::clone(&cleanup));

        Self {
            registry: Arc::new(registry),
            notifier,
            log,
            save,
            notify,
            cleanup,
            globals: RwLock::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Arc<CallbackRegistry> {
        &self.registry
    }

    /// Append a global callback. Re-adding a name replaces it in place.
    pub fn add_global(&self, name: impl Into<String>, callback: Arc<dyn FailureCallback>) {
        let name = name.into();
        let mut globals = self.globals.write().unwrap_or_else(PoisonError::into_inner);
        match globals.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = callback,
            None => globals.push((name, callback)),
        }
    }

    /// Returns whether a callback of that name was removed.
    pub fn remove_global(&self, name: &str) -> bool {
        let mut globals = self.globals.write().unwrap_or_else(PoisonError::into_inner);
        let before = globals.len();
        globals.retain(|(existing, _)| existing != name);
        globals.len() != before
    }

    pub fn global_names(&self) -> Vec<String> {
        self.globals
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn resolve(&self, step: &CallbackStep) -> Option<Arc<dyn FailureCallback>> {
        match step {
            CallbackStep::Log => Some(Arc::clone(&self.log)),
            CallbackStep::PersistDetails => Some(Arc::clone(&self.save)),
            CallbackStep::Notify => Some(Arc::clone(&self.notify)),
            CallbackStep::Cleanup => Some(Arc::clone(&self.cleanup)),
            CallbackStep::Custom(name) => self.registry.get(name),
            CallbackStep::Email(address) => Some(Arc::new(SendNotification::new(
                Arc::clone(&self.notifier),
                address.clone(),
            ))),
        }
    }

    /// Run every applicable callback for `ctx`.
    pub async fn run(
        &self,
        ctx: &FailureContext,
        config: Option<&CallbackConfig>,
        task_callback: Option<&Arc<dyn FailureCallback>>,
    ) -> PipelineReport {
        let steps = config.map_or_else(|| vec![CallbackStep::Log], CallbackConfig::steps);

        let mut chain: Vec<(String, Arc<dyn FailureCallback>)> = Vec::new();
        let mut report = PipelineReport::default();
        for step in &steps {
            match self.resolve(step) {
                Some(callback) => chain.push((step.label(), callback)),
                None => {
                    tracing::warn!(
                        task_id = %ctx.task_id,
                        callback = %step.label(),
                        "custom failure callback not registered"
                    );
                    report.missing.push(step.label());
                }
            }
        }
        // snapshot so the lock is not held across awaits
        chain.extend(
            self.globals
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned(),
        );
        if let Some(callback) = task_callback {
            chain.push(("task_callback".to_string(), Arc::clone(callback)));
        }

        for (label, callback) in chain {
            if !invoke(&label, callback.as_ref(), ctx).await {
                report.failed.push(label.clone());
            }
            report.invoked.push(label);
        }
        report
    }
}

/// Invoke one callback in isolation; returns whether it succeeded.
pub(crate) async fn invoke(label: &str, callback: &dyn FailureCallback, ctx: &FailureContext) -> bool {
    match AssertUnwindSafe(callback.on_failure(ctx)).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            tracing::warn!(
                task_id = %ctx.task_id,
                callback = %label,
                error = %err,
                "failure callback returned an error"
            );
            false
        }
        Err(panic) => {
            tracing::warn!(
                task_id = %ctx.task_id,
                callback = %label,
                "failure callback panicked: {}",
                panic_message(panic.as_ref())
            );
            false
        }
    }
}
