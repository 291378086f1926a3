//! Scheduled task definitions.
//!
//! Defines the [`ScheduledTask`] type, its [`TaskPriority`], the
//! [`TaskState`] used to gate dispatch, and the [`TaskRunRecord`]
//! emitted after every execution.

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Future returned by a task action.
pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

/// The work a task performs. Called once per execution.
pub type TaskAction = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Dispatch priority. Higher priorities are dispatched first within a pass.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    /// Dispatched after everything else.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Dispatched first.
    High,
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Execution state of a registered task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskState {
    /// Not running; eligible once its interval has elapsed.
    #[default]
    Idle,
    /// An execution is in flight. Never dispatched again until it finishes.
    Running,
    /// The last execution failed; eligible again at `retry_at`.
    FailedPendingRetry {
        /// Earliest instant the task may be retried.
        retry_at: Instant,
    },
}

/// A recurring unit of work.
#[derive(Clone)]
pub struct ScheduledTask {
    id: Uuid,
    name: String,
    priority: TaskPriority,
    interval: Duration,
    last_run: Option<Instant>,
    enabled: bool,
    due_now: bool,
    state: TaskState,
    failure_streak: u32,
    last_error: Option<String>,
    run_count: u64,
    action: TaskAction,
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("interval", &self.interval)
            .field("last_run", &self.last_run)
            .field("enabled", &self.enabled)
            .field("due_now", &self.due_now)
            .field("state", &self.state)
            .field("failure_streak", &self.failure_streak)
            .field("last_error", &self.last_error)
            .field("run_count", &self.run_count)
            .finish_non_exhaustive()
    }
}

impl ScheduledTask {
    /// Create a new enabled task that has never run.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        priority: TaskPriority,
        interval: Duration,
        action: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let action: TaskAction = Arc::new(move || action().boxed());
        Self::from_action(name, priority, interval, action)
    }

    /// Create a task from an already boxed action.
    pub fn from_action(
        name: impl Into<String>,
        priority: TaskPriority,
        interval: Duration,
        action: TaskAction,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            priority,
            interval,
            last_run: None,
            enabled: true,
            due_now: false,
            state: TaskState::Idle,
            failure_streak: 0,
            last_error: None,
            run_count: 0,
            action,
        }
    }

    /// Registration identifier, refreshed each time the task is added to a scheduler.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dispatch priority.
    pub fn priority(&self) -> TaskPriority {
        self.priority
    }

    /// Minimum time between successful runs.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Completion instant of the last successful run, `None` if never run.
    pub fn last_run(&self) -> Option<Instant> {
        self.last_run
    }

    /// Whether the task takes part in scheduling.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Current execution state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// Consecutive failed executions.
    pub fn failure_streak(&self) -> u32 {
        self.failure_streak
    }

    /// Description of the most recent failure, cleared on success.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Number of successful executions.
    pub fn run_count(&self) -> u64 {
        self.run_count
    }

    /// Enable or disable the task.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Returns `true` if the task should be dispatched at `now`.
    pub fn is_due_at(&self, now: Instant) -> bool {
        if !self.enabled || self.state == TaskState::Running {
            return false;
        }
        if self.due_now {
            return true;
        }

        match self.state {
            TaskState::Running => false,
            TaskState::FailedPendingRetry { retry_at } => now >= retry_at,
            TaskState::Idle => match self.last_run {
                None => true,
                Some(last) => now.saturating_duration_since(last) >= self.interval,
            },
        }
    }

    /// Returns `true` if the task should be dispatched now.
    pub fn is_due(&self) -> bool {
        self.is_due_at(Instant::now())
    }

    /// Invoke the action and stamp `last_run` with the completion time.
    ///
    /// # Errors
    ///
    /// Returns the action's error unchanged; `last_run` is left untouched.
    pub async fn execute(&mut self) -> anyhow::Result<()> {
        (self.action)().await?;
        self.last_run = Some(Instant::now());
        Ok(())
    }

    /// Make the task due at the next pass.
    ///
    /// A request made while the task is running holds until that execution
    /// finishes, so the task runs again at the following pass.
    pub fn mark_due_now(&mut self) {
        self.due_now = true;
        if self.state != TaskState::Running {
            self.state = TaskState::Idle;
        }
    }

    pub(crate) fn mark_running(&mut self) {
        self.state = TaskState::Running;
        self.due_now = false;
    }

    /// Drop a `Running` state whose execution will never report back.
    pub(crate) fn release(&mut self) {
        if self.state == TaskState::Running {
            self.state = TaskState::Idle;
        }
    }

    /// Prepare a task for insertion into a scheduler: new id, never `Running`.
    pub(crate) fn prepare_registration(&mut self) {
        self.id = Uuid::new_v4();
        self.release();
    }

    /// Record a successful execution that completed at `completed_at`.
    pub fn mark_run_success(&mut self, completed_at: Instant) {
        self.last_run = Some(completed_at);
        self.state = TaskState::Idle;
        self.failure_streak = 0;
        self.last_error = None;
        self.run_count = self.run_count.saturating_add(1);
    }

    /// Record a failed execution; the task becomes due again after `backoff`.
    pub fn mark_run_failure(&mut self, failed_at: Instant, error: &str, backoff: Duration) {
        self.failure_streak = self.failure_streak.saturating_add(1);
        self.last_error = Some(error.to_owned());
        self.state = TaskState::FailedPendingRetry {
            retry_at: failed_at + backoff,
        };
    }
}

/// How a single execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunOutcome {
    /// The action returned `Ok`.
    Success,
    /// The action returned an error.
    Failed,
    /// The action panicked.
    Panicked,
}

/// One completed execution, as reported to the observability sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunRecord {
    /// Name of the task that ran.
    pub task_name: String,
    /// Priority at dispatch time.
    pub priority: TaskPriority,
    /// Wall-clock dispatch time.
    pub started_at: DateTime<Utc>,
    /// Wall-clock completion time.
    pub finished_at: DateTime<Utc>,
    /// How the execution ended.
    pub outcome: TaskRunOutcome,
    /// Error description for failed or panicked runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskRunRecord {
    /// Returns `true` if the execution succeeded.
    pub fn is_success(&self) -> bool {
        self.outcome == TaskRunOutcome::Success
    }
}
