//! Task record: lifecycle state + input/outcome.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::callback::CallbackConfig;
use super::ids::TaskId;

/// Caller-supplied discriminator for the type of work.
///
/// The engine never interprets it; it is used for stats and filtering only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskKind {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Task status.
///
/// State transitions:
/// - Pending -> Running -> Completed
/// - Pending -> Running -> Failed (work error, panic or cancellation)
/// - Pending -> Failed (cancelled before a slot was granted)
/// - any -> Expired (age exceeded the TTL; eviction pending)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Expired,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Expired,
    ];

    /// Is this a terminal state (cancel is refused)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Expired
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Running) | (Pending, Failed) => true,
            (Running, Completed) | (Running, Failed) => true,
            (Expired, Expired) => false,
            (_, Expired) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Details kept for a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub message: String,

    /// Rendered `source()` chain of the work error, if it had one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

impl FailureInfo {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }
}

/// Terminal business outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "lowercase")]
pub enum TaskOutcome {
    Completed(serde_json::Value),
    Failed(FailureInfo),
}

#[derive(Debug, thiserror::Error)]
#[error("invalid transition for {id}: {from} -> {to}")]
pub struct TransitionError {
    pub id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Metadata + payload for one task.
///
/// Design:
/// - This is the single source of truth for a task's state.
/// - `status`, `outcome` and `progress` change only through the transition
///   methods, so `result()` is `Some` iff Completed and `error_message()` is
///   `Some` iff Failed.
/// - `version` is bumped on every mutation (used for compare-and-swap).
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub kind: TaskKind,
    pub input: serde_json::Value,

    pub retry_count: u32,
    pub max_retries: u32,

    /// Failure pipeline configuration supplied at submission.
    pub callbacks: Option<CallbackConfig>,

    pub created_at: DateTime<Utc>,

    status: TaskStatus,
    outcome: Option<TaskOutcome>,
    progress: u8,
    updated_at: DateTime<Utc>,
    version: u64,
}

impl TaskRecord {
    pub fn new(id: TaskId, kind: TaskKind, input: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind,
            input,
            retry_count: 0,
            max_retries: 0,
            callbacks: None,
            created_at: now,
            status: TaskStatus::Pending,
            outcome: None,
            progress: 0,
            updated_at: now,
            version: 0,
        }
    }

    pub fn with_retries(mut self, retry_count: u32, max_retries: u32) -> Self {
        self.retry_count = retry_count;
        self.max_retries = max_retries;
        self
    }

    pub fn with_callbacks(mut self, callbacks: Option<CallbackConfig>) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn progress(&self) -> u8 {
        self.progress
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn outcome(&self) -> Option<&TaskOutcome> {
        self.outcome.as_ref()
    }

    pub fn result(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            Some(TaskOutcome::Completed(value)) => Some(value),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureInfo> {
        match &self.outcome {
            Some(TaskOutcome::Failed(info)) => Some(info),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        self.failure().map(|info| info.message.as_str())
    }

    /// `now - created_at > ttl`. A clock that went backwards never expires a task.
    pub fn is_expired_at(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        (now - self.created_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false)
    }

    /// Pending -> Running (slot granted).
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Running, now)?;
        self.progress = 10;
        Ok(())
    }

    /// Running -> Completed.
    pub fn complete(
        &mut self,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Completed, now)?;
        self.outcome = Some(TaskOutcome::Completed(result));
        self.progress = 100;
        Ok(())
    }

    /// Pending/Running -> Failed.
    pub fn fail(&mut self, info: FailureInfo, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Failed, now)?;
        self.outcome = Some(TaskOutcome::Failed(info));
        Ok(())
    }

    /// any -> Expired. The outcome is dropped with the record's business meaning.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Expired, now)?;
        self.outcome = None;
        Ok(())
    }

    /// Advisory progress update; returns whether it was applied.
    ///
    /// Only applied while Running, and never lowers the current value.
    pub fn report_progress(&mut self, progress: u8, now: DateTime<Utc>) -> bool {
        let progress = progress.min(100);
        if self.status != TaskStatus::Running || progress < self.progress {
            return false;
        }
        self.progress = progress;
        self.touch(now);
        true
    }

    fn transition(&mut self, to: TaskStatus, now: DateTime<Utc>) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(to) {
            return Err(TransitionError {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.touch(now);
        Ok(())
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        // updated_at >= created_at even if the clock steps backwards
        self.updated_at = now.max(self.created_at);
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use ulid::Ulid;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::from_ulid(Ulid::new()),
            TaskKind::new("zh2en"),
            serde_json::json!({"text": "hi"}),
            t0(),
        )
    }

    #[test]
    fn new_record_is_pending_without_outcome() {
        let r = record();
        assert_eq!(r.status(), TaskStatus::Pending);
        assert_eq!(r.progress(), 0);
        assert!(r.result().is_none());
        assert!(r.error_message().is_none());
        assert_eq!(r.updated_at(), r.created_at);
    }

    #[test]
    fn happy_path_sets_progress_and_result() {
        let mut r = record();
        r.start(t0()).unwrap();
        assert_eq!(r.status(), TaskStatus::Running);
        assert_eq!(r.progress(), 10);

        r.complete(serde_json::json!("hello"), t0()).unwrap();
        assert_eq!(r.status(), TaskStatus::Completed);
        assert_eq!(r.progress(), 100);
        assert_eq!(r.result(), Some(&serde_json::json!("hello")));
        assert!(r.error_message().is_none());
        assert_eq!(r.version(), 2);
    }

    #[test]
    fn failure_sets_error_message_only() {
        let mut r = record();
        r.start(t0()).unwrap();
        r.fail(FailureInfo::new("boom"), t0()).unwrap();
        assert_eq!(r.status(), TaskStatus::Failed);
        assert_eq!(r.error_message(), Some("boom"));
        assert!(r.result().is_none());
    }

    #[test]
    fn completed_task_cannot_run_again() {
        let mut r = record();
        r.start(t0()).unwrap();
        r.complete(serde_json::json!(1), t0()).unwrap();

        let err = r.start(t0()).unwrap_err();
        assert_eq!(err.from, TaskStatus::Completed);
        assert_eq!(err.to, TaskStatus::Running);
        assert!(r.fail(FailureInfo::new("late"), t0()).is_err());
        assert_eq!(r.result(), Some(&serde_json::json!(1)));
    }

    #[test]
    fn expire_clears_outcome() {
        let mut r = record();
        r.start(t0()).unwrap();
        r.complete(serde_json::json!(1), t0()).unwrap();
        r.expire(t0()).unwrap();
        assert_eq!(r.status(), TaskStatus::Expired);
        assert!(r.result().is_none());
        assert!(r.expire(t0()).is_err());
    }

    #[rstest]
    #[case(TaskStatus::Pending, TaskStatus::Running, true)]
    #[case(TaskStatus::Pending, TaskStatus::Failed, true)]
    #[case(TaskStatus::Pending, TaskStatus::Completed, false)]
    #[case(TaskStatus::Running, TaskStatus::Completed, true)]
    #[case(TaskStatus::Running, TaskStatus::Failed, true)]
    #[case(TaskStatus::Running, TaskStatus::Pending, false)]
    #[case(TaskStatus::Completed, TaskStatus::Running, false)]
    #[case(TaskStatus::Completed, TaskStatus::Failed, false)]
    #[case(TaskStatus::Failed, TaskStatus::Completed, false)]
    #[case(TaskStatus::Completed, TaskStatus::Expired, true)]
    #[case(TaskStatus::Failed, TaskStatus::Expired, true)]
    #[case(TaskStatus::Pending, TaskStatus::Expired, true)]
    #[case(TaskStatus::Expired, TaskStatus::Pending, false)]
    #[case(TaskStatus::Expired, TaskStatus::Expired, false)]
    fn transition_table(#[case] from: TaskStatus, #[case] to: TaskStatus, #[case] allowed: bool) {
        assert_eq!(from.can_transition_to(to), allowed);
    }

    #[test]
    fn progress_is_monotonic_while_running() {
        let mut r = record();
        assert!(!r.report_progress(50, t0()), "ignored while pending");

        r.start(t0()).unwrap();
        assert!(r.report_progress(40, t0()));
        assert!(!r.report_progress(20, t0()));
        assert!(r.report_progress(250, t0()));
        assert_eq!(r.progress(), 100);
    }

    #[test]
    fn updated_at_never_precedes_created_at() {
        let mut r = record();
        let earlier = t0() - chrono::Duration::seconds(30);
        r.start(earlier).unwrap();
        assert_eq!(r.updated_at(), r.created_at);
    }

    #[test]
    fn expiry_is_strictly_greater_than_ttl() {
        let r = record();
        let ttl = Duration::from_secs(60);
        assert!(!r.is_expired_at(t0() + chrono::Duration::seconds(60), ttl));
        assert!(r.is_expired_at(t0() + chrono::Duration::seconds(61), ttl));
        assert!(!r.is_expired_at(t0() - chrono::Duration::seconds(5), ttl));
    }

    #[test]
    fn status_serializes_lowercase() {
        let s = serde_json::to_string(&TaskStatus::Completed).unwrap();
        assert_eq!(s, "\"completed\"");
    }
}
