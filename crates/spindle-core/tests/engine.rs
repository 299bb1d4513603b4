use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rstest::rstest;
use spindle_core::domain::{TaskRecord, TransitionError};
use spindle_core::impls::InMemoryTaskStore;
use spindle_core::ports::{RecordFilter, StoreError, TaskStore};
use spindle_core::{
    CallbackConfig, CallbackError, CallbackSettings, EngineBuilder, EngineConfig, FailureContext,
    ResultBody, SubmitOptions, TaskId, TaskManager, TaskStatus, WorkError, WorkFunction,
    sync_callback_fn, work_fn,
};

fn config(dir: &std::path::Path, max_concurrent: usize) -> EngineConfig {
    EngineConfig {
        max_concurrent,
        callbacks: CallbackSettings {
            failure_dir: dir.join("failures"),
            scratch_dir: dir.join("temp"),
            stats_file: dir.join("failure_stats.json"),
            notification_destination: "ops".to_string(),
        },
        ..EngineConfig::default()
    }
}

fn engine(
    dir: &std::path::Path,
    max_concurrent: usize,
    work: impl WorkFunction + 'static,
) -> TaskManager {
    EngineBuilder::new(work)
        .config(config(dir, max_concurrent))
        .build()
        .unwrap()
}

fn sleeper(ms: u64) -> impl WorkFunction + 'static {
    work_fn(move |_kind, input, _ctx| async move {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(input)
    })
}

async fn wait_terminal(manager: &TaskManager, id: TaskId) -> TaskStatus {
    for _ in 0..400 {
        let status = manager.status(id).unwrap().status;
        if status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {id} did not reach a terminal state");
}

#[tokio::test]
async fn single_slot_runs_tasks_one_after_another() {
    let dir = tempfile::tempdir().unwrap();
    let manager = engine(dir.path(), 1, sleeper(100));

    let started = Instant::now();
    let first = manager
        .submit("a", serde_json::json!(1), SubmitOptions::new())
        .unwrap();
    let second = manager
        .submit("a", serde_json::json!(2), SubmitOptions::new())
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(manager.status(first).unwrap().status, TaskStatus::Running);
    assert_eq!(manager.status(second).unwrap().status, TaskStatus::Pending);

    assert_eq!(wait_terminal(&manager, first).await, TaskStatus::Completed);
    assert_eq!(wait_terminal(&manager, second).await, TaskStatus::Completed);
    assert!(started.elapsed() >= Duration::from_millis(190));
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(4)]
#[tokio::test]
async fn running_count_never_exceeds_limit(#[case] max_concurrent: usize) {
    let dir = tempfile::tempdir().unwrap();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let work = {
        let current = Arc::clone(&current);
        let peak = Arc::clone(&peak);
        work_fn(move |_kind, input, _ctx| {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(15)).await;
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(input)
            }
        })
    };
    let manager = engine(dir.path(), max_concurrent, work);

    let ids: Vec<TaskId> = (0..10)
        .map(|i| {
            manager
                .submit("a", serde_json::json!(i), SubmitOptions::new())
                .unwrap()
        })
        .collect();

    for _ in 0..10 {
        let stats = manager.stats().unwrap();
        assert!(stats.active_running <= max_concurrent, "{stats:?}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for id in ids {
        assert_eq!(wait_terminal(&manager, id).await, TaskStatus::Completed);
    }
    assert!(peak.load(Ordering::SeqCst) <= max_concurrent);
    assert_eq!(manager.stats().unwrap().active_running, 0);
}

/// Store that tracks how many records are Running, updated inside each write.
#[derive(Default)]
struct RunningGauge {
    inner: InMemoryTaskStore,
    running: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

impl TaskStore for RunningGauge {
    fn insert(&self, record: TaskRecord) -> Result<(), StoreError> {
        self.inner.insert(record)
    }

    fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.inner.get(id)
    }

    fn delete(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.inner.delete(id)
    }

    fn delete_if(
        &self,
        id: TaskId,
        predicate: RecordFilter<'_>,
    ) -> Result<Option<TaskRecord>, StoreError> {
        self.inner.delete_if(id, predicate)
    }

    fn list(&self, filter: RecordFilter<'_>) -> Result<Vec<TaskRecord>, StoreError> {
        self.inner.list(filter)
    }

    fn modify(
        &self,
        id: TaskId,
        apply: &mut dyn FnMut(&mut TaskRecord) -> Result<(), TransitionError>,
    ) -> Result<TaskRecord, StoreError> {
        self.inner.modify(id, &mut |record| {
            let before = record.status();
            apply(record)?;
            let after = record.status();
            if before != TaskStatus::Running && after == TaskStatus::Running {
                let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
            } else if before == TaskStatus::Running && after != TaskStatus::Running {
                self.running.fetch_sub(1, Ordering::SeqCst);
            }
            if !before.is_terminal() && after.is_terminal() {
                self.finished.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
    }

    fn compare_and_swap(
        &self,
        id: TaskId,
        expected_version: u64,
        record: TaskRecord,
    ) -> Result<(), StoreError> {
        self.inner.compare_and_swap(id, expected_version, record)
    }

    fn len(&self) -> Result<usize, StoreError> {
        self.inner.len()
    }
}

#[rstest]
#[case(1)]
#[case(3)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_records_never_exceed_limit_across_threads(#[case] max_concurrent: usize) {
    const TASKS: usize = 2000;
    let dir = tempfile::tempdir().unwrap();
    let gauge = Arc::new(RunningGauge::default());
    let manager = EngineBuilder::new(work_fn(|_kind, input, _ctx| async move { Ok(input) }))
        .config(config(dir.path(), max_concurrent))
        .store(gauge.clone())
        .build()
        .unwrap();

    for i in 0..TASKS {
        manager
            .submit("a", serde_json::json!(i), SubmitOptions::new())
            .unwrap();
    }

    let deadline = Instant::now() + Duration::from_secs(30);
    while gauge.finished.load(Ordering::SeqCst) < TASKS {
        assert!(Instant::now() < deadline, "tasks did not finish in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let peak = gauge.peak.load(Ordering::SeqCst);
    assert!(
        peak <= max_concurrent,
        "{peak} records Running with max_concurrent = {max_concurrent}"
    );
    assert_eq!(gauge.running.load(Ordering::SeqCst), 0);
    assert_eq!(manager.stats().unwrap().active_running, 0);
}

#[tokio::test]
async fn observed_statuses_follow_the_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let manager = engine(dir.path(), 1, sleeper(40));
    let blocker = manager
        .submit("a", serde_json::json!(0), SubmitOptions::new())
        .unwrap();
    let id = manager
        .submit("a", serde_json::json!(1), SubmitOptions::new())
        .unwrap();

    let mut seen = vec![manager.status(id).unwrap().status];
    while !seen.last().unwrap().is_terminal() {
        tokio::time::sleep(Duration::from_millis(2)).await;
        let status = manager.status(id).unwrap().status;
        if Some(&status) != seen.last() {
            seen.push(status);
        }
    }

    assert_eq!(
        seen,
        vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Completed]
    );
    wait_terminal(&manager, blocker).await;
}

#[tokio::test]
async fn work_error_becomes_failed_with_message() {
    let dir = tempfile::tempdir().unwrap();
    let manager = engine(
        dir.path(),
        2,
        work_fn(|_kind, _input, _ctx| async move { Err(WorkError::new("ValueError: boom")) }),
    );

    let id = manager
        .submit("a", serde_json::json!({}), SubmitOptions::new())
        .unwrap();

    assert_eq!(wait_terminal(&manager, id).await, TaskStatus::Failed);
    let view = manager.result(id).unwrap();
    match view.body {
        ResultBody::ErrorMessage(message) => assert!(message.contains("boom")),
        other => panic!("expected an error message, got {other:?}"),
    }
}

#[tokio::test]
async fn result_and_error_are_mutually_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let manager = engine(
        dir.path(),
        2,
        work_fn(|_kind, input: serde_json::Value, _ctx| async move {
            if input["fail"].as_bool().unwrap_or(false) {
                return Err(WorkError::new("requested failure"));
            }
            Ok(serde_json::json!("done"))
        }),
    );
    let ok = manager
        .submit("a", serde_json::json!({"fail": false}), SubmitOptions::new())
        .unwrap();
    let failed = manager
        .submit("a", serde_json::json!({"fail": true}), SubmitOptions::new())
        .unwrap();
    wait_terminal(&manager, ok).await;
    wait_terminal(&manager, failed).await;

    let ok = serde_json::to_value(manager.result(ok).unwrap()).unwrap();
    assert_eq!(ok["status"], "completed");
    assert_eq!(ok["result"], "done");
    assert!(ok.get("error_message").is_none());

    let failed = serde_json::to_value(manager.result(failed).unwrap()).unwrap();
    assert_eq!(failed["status"], "failed");
    assert_eq!(failed["error_message"], "requested failure");
    assert!(failed.get("result").is_none());
}

#[tokio::test]
async fn cancel_is_immediate_and_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let manager = engine(dir.path(), 1, sleeper(5_000));

    let id = manager
        .submit("a", serde_json::json!({}), SubmitOptions::new())
        .unwrap();
    assert!(manager.cancel(id));

    let view = manager.result(id).unwrap();
    assert_eq!(view.status, TaskStatus::Failed);
    assert_eq!(
        view.body,
        ResultBody::ErrorMessage("cancelled by user".to_string())
    );
    assert!(!manager.cancel(id));

    // the slot is given back even though the work would run for seconds
    let next = manager
        .submit("a", serde_json::json!({}), SubmitOptions::new())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(manager.status(next).unwrap().status, TaskStatus::Running);
    assert!(manager.cancel(next));
}

#[tokio::test]
async fn cancel_unknown_or_completed_returns_false() {
    let dir = tempfile::tempdir().unwrap();
    let manager = engine(dir.path(), 1, sleeper(0));

    let unknown: TaskId = "01ARZ3NDEKTSV4RRFFQ69G5FAV".parse().unwrap();
    assert!(!manager.cancel(unknown));
    assert!(manager.status(unknown).unwrap_err().is_not_found());

    let id = manager
        .submit("a", serde_json::json!({}), SubmitOptions::new())
        .unwrap();
    assert_eq!(wait_terminal(&manager, id).await, TaskStatus::Completed);
    assert!(!manager.cancel(id));
}

#[tokio::test]
async fn stats_count_by_kind() {
    let dir = tempfile::tempdir().unwrap();
    let manager = engine(dir.path(), 5, sleeper(0));

    for kind in ["A", "A", "B", "B", "B"] {
        manager
            .submit(kind, serde_json::json!({}), SubmitOptions::new())
            .unwrap();
    }

    let stats = manager.stats().unwrap();
    assert_eq!(stats.total_tasks, 5);
    assert_eq!(stats.max_concurrent, 5);
    assert_eq!(stats.by_kind.len(), 2);
    assert_eq!(stats.by_kind["A"], 2);
    assert_eq!(stats.by_kind["B"], 3);
}

fn counting_callback(
    calls: &Arc<Mutex<Vec<TaskId>>>,
) -> Arc<dyn spindle_core::FailureCallback> {
    let calls = Arc::clone(calls);
    Arc::new(sync_callback_fn(move |ctx: &FailureContext| {
        calls.lock().unwrap().push(ctx.task_id);
        Ok(())
    }))
}

async fn wait_for_calls(calls: &Arc<Mutex<Vec<TaskId>>>, n: usize) {
    for _ in 0..200 {
        if calls.lock().unwrap().len() >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn custom_callback_runs_once_for_the_failed_task() {
    let dir = tempfile::tempdir().unwrap();
    let manager = engine(
        dir.path(),
        1,
        work_fn(|_kind, _input, _ctx| async move { Err(WorkError::new("boom")) }),
    );
    let calls = Arc::new(Mutex::new(Vec::new()));
    manager.register_callback("audit", counting_callback(&calls));

    let callbacks = CallbackConfig {
        custom_callback_name: Some("audit".to_string()),
        ..CallbackConfig::log_only()
    };
    let id = manager
        .submit(
            "a",
            serde_json::json!({}),
            SubmitOptions::new().callbacks(callbacks),
        )
        .unwrap();
    wait_terminal(&manager, id).await;
    wait_for_calls(&calls, 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(*calls.lock().unwrap(), vec![id]);
}

#[tokio::test]
async fn throwing_callback_does_not_stop_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let manager = engine(
        dir.path(),
        1,
        work_fn(|_kind, _input, _ctx| async move { Err(WorkError::new("boom")) }),
    );
    manager.register_callback(
        "broken",
        Arc::new(sync_callback_fn(|_ctx: &FailureContext| {
            Err(CallbackError::Failed("callback bug".to_string()))
        })),
    );
    let task_calls = Arc::new(Mutex::new(Vec::new()));

    let callbacks = CallbackConfig {
        save_failure_details: true,
        cleanup: false,
        custom_callback_name: Some("broken".to_string()),
        ..CallbackConfig::log_only()
    };
    let id = manager
        .submit(
            "a",
            serde_json::json!({}),
            SubmitOptions::new()
                .callbacks(callbacks)
                .on_failure(counting_callback(&task_calls)),
        )
        .unwrap();
    wait_terminal(&manager, id).await;
    wait_for_calls(&task_calls, 1).await;

    assert_eq!(*task_calls.lock().unwrap(), vec![id]);
    assert_eq!(manager.status(id).unwrap().status, TaskStatus::Failed);
    let saved = std::fs::read_dir(dir.path().join("failures")).unwrap().count();
    assert_eq!(saved, 1);
}

#[tokio::test]
async fn cancelled_task_runs_failure_callbacks() {
    let dir = tempfile::tempdir().unwrap();
    let manager = engine(dir.path(), 1, sleeper(5_000));
    let calls = Arc::new(Mutex::new(Vec::new()));
    manager.add_global_callback("global", counting_callback(&calls));

    let id = manager
        .submit("a", serde_json::json!({}), SubmitOptions::new())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(manager.cancel(id));
    wait_for_calls(&calls, 1).await;

    assert_eq!(*calls.lock().unwrap(), vec![id]);
}

#[tokio::test]
async fn expired_task_is_gone_after_ttl() {
    let dir = tempfile::tempdir().unwrap();
    let manager = EngineBuilder::new(sleeper(0))
        .config(EngineConfig {
            task_ttl_ms: 50,
            ..config(dir.path(), 2)
        })
        .build()
        .unwrap();

    let id = manager
        .submit("a", serde_json::json!({}), SubmitOptions::new())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(manager.status(id).unwrap_err().is_not_found());
    assert!(manager.result(id).unwrap_err().is_not_found());
    assert!(manager.list(None, 0).unwrap().iter().all(|view| view.id != id));
}

#[tokio::test]
async fn reaper_evicts_expired_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let manager = EngineBuilder::new(sleeper(0))
        .config(EngineConfig {
            task_ttl_ms: 30,
            reaper_interval_ms: 10,
            ..config(dir.path(), 2)
        })
        .build()
        .unwrap();
    manager.start().unwrap();

    manager
        .submit("a", serde_json::json!({}), SubmitOptions::new())
        .unwrap();
    manager
        .submit("b", serde_json::json!({}), SubmitOptions::new())
        .unwrap();
    assert_eq!(manager.stats().unwrap().total_tasks, 2);

    tokio::time::sleep(Duration::from_millis(120)).await;

    let stats = manager.stats().unwrap();
    assert_eq!(stats.total_tasks, 0, "{stats:?}");
    assert!(manager.list(Some(TaskStatus::Expired), 0).unwrap().is_empty());
    manager.stop().await;
}
