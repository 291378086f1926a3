//! Scheduler run loop.
//!
//! Each pass scans the registered tasks for due entries, dispatches them
//! highest priority first onto a [`JoinSet`], and sleeps one tick. The
//! loop stops when its [`CancellationToken`] is cancelled; executions
//! still in flight at that moment are never aborted.

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::scheduler::tasks::{ScheduledTask, TaskRunOutcome, TaskRunRecord};
use chrono::Utc;
use futures_util::FutureExt;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Whether a run session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No session is dispatching work.
    Stopped,
    /// A session is dispatching work.
    Running,
}

/// Why a run session ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopReason {
    /// The cancellation token was cancelled.
    #[default]
    Cancelled,
}

/// Counters for one finished run session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Scheduling passes executed.
    pub passes: u64,
    /// Executions dispatched across all passes.
    pub dispatched: u64,
    /// Executions not yet finished when dispatch stopped.
    pub in_flight_at_stop: usize,
    /// Why the session ended.
    pub stop_reason: StopReason,
}

/// Priority scheduler for recurring tasks.
///
/// Cloning yields another handle to the same task collection and history.
#[derive(Clone)]
pub struct Scheduler {
    /// Registered tasks, in registration order.
    tasks: Arc<Mutex<Vec<ScheduledTask>>>,
    /// Recent run history, oldest first.
    history: Arc<Mutex<VecDeque<TaskRunRecord>>>,
    /// Set while a run session is active.
    running: Arc<AtomicBool>,
    /// Run loop settings.
    config: SchedulerConfig,
    /// Optional channel receiving every run record.
    result_tx: Option<mpsc::UnboundedSender<TaskRunRecord>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.len())
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Create a scheduler with default settings and no tasks.
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(Mutex::new(Vec::new())),
            history: Arc::new(Mutex::new(VecDeque::new())),
            running: Arc::new(AtomicBool::new(false)),
            config: SchedulerConfig::default(),
            result_tx: None,
        }
    }

    /// Replace the run loop settings.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Send every run record to `tx` in addition to the in-memory history.
    pub fn with_result_sink(mut self, tx: mpsc::UnboundedSender<TaskRunRecord>) -> Self {
        self.result_tx = Some(tx);
        self
    }

    /// Active settings.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register a task.
    ///
    /// The task gets a fresh registration id and is never stored as
    /// running, so a snapshot taken mid-execution can be re-added safely.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::DuplicateTask`] if a task with the same
    /// name is already registered; the collection is left unchanged.
    pub fn add_task(&self, mut task: ScheduledTask) -> Result<()> {
        let mut tasks = self.lock_tasks();
        if tasks.iter().any(|t| t.name() == task.name()) {
            return Err(SchedulerError::DuplicateTask(task.name().to_owned()));
        }
        task.prepare_registration();
        debug!(
            task = task.name(),
            priority = %task.priority(),
            interval_ms = task.interval().as_millis() as u64,
            "task registered"
        );
        tasks.push(task);
        Ok(())
    }

    /// Remove a task by name. Returns `true` when found.
    ///
    /// An execution already in flight keeps running; its result is dropped.
    pub fn remove_task(&self, name: &str) -> bool {
        let mut tasks = self.lock_tasks();
        let Some(pos) = tasks.iter().position(|t| t.name() == name) else {
            return false;
        };
        tasks.remove(pos);
        debug!(task = name, "task removed");
        true
    }

    /// Snapshot of all registered tasks, in registration order.
    pub fn tasks(&self) -> Vec<ScheduledTask> {
        self.lock_tasks().clone()
    }

    /// Snapshot of one task by name.
    pub fn task(&self, name: &str) -> Option<ScheduledTask> {
        self.lock_tasks().iter().find(|t| t.name() == name).cloned()
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.lock_tasks().len()
    }

    /// Returns `true` if no task is registered.
    pub fn is_empty(&self) -> bool {
        self.lock_tasks().is_empty()
    }

    /// Enables or disables a task by name. Returns `true` when found.
    pub fn set_task_enabled(&self, name: &str, enabled: bool) -> bool {
        if let Some(task) = self.lock_tasks().iter_mut().find(|t| t.name() == name) {
            task.set_enabled(enabled);
            return true;
        }
        false
    }

    /// Marks a task due at the next pass. Returns `true` when found.
    pub fn mark_task_due_now(&self, name: &str) -> bool {
        if let Some(task) = self.lock_tasks().iter_mut().find(|t| t.name() == name) {
            task.mark_due_now();
            return true;
        }
        false
    }

    /// Recent run history, oldest first.
    pub fn history(&self) -> Vec<TaskRunRecord> {
        self.lock_history().iter().cloned().collect()
    }

    /// Whether a run session is active.
    pub fn state(&self) -> SchedulerState {
        if self.running.load(Ordering::Acquire) {
            SchedulerState::Running
        } else {
            SchedulerState::Stopped
        }
    }

    /// Tasks that would be dispatched by a pass right now, in dispatch order.
    pub fn due_tasks(&self) -> Vec<ScheduledTask> {
        let now = Instant::now();
        let mut due: Vec<ScheduledTask> = self
            .lock_tasks()
            .iter()
            .filter(|t| t.is_due_at(now))
            .cloned()
            .collect();
        sort_for_dispatch(&mut due);
        due
    }

    /// Run a single pass and wait for every execution it dispatched.
    ///
    /// Returns the dispatched task names in dispatch order.
    pub async fn run_pass(&self) -> Vec<String> {
        let mut in_flight = InFlight::default();
        let dispatched = self.tick(&mut in_flight);
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!("task execution did not complete: {e}");
            }
        }
        dispatched
    }

    /// Run the scheduling loop until `cancel` is cancelled.
    ///
    /// Cancellation is a normal stop and yields `Ok`.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::AlreadyRunning`] if another session is
    /// active, or [`SchedulerError::Config`] for an invalid tick interval.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        self.config.validate()?;
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SchedulerError::AlreadyRunning);
        }
        let _session = SessionGuard(&self.running);

        let tick = self.config.tick_interval();
        info!(
            tasks = self.len(),
            tick_ms = self.config.tick_interval_ms,
            "scheduler started"
        );

        let mut in_flight = InFlight::default();
        let mut summary = RunSummary::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let dispatched = self.tick(&mut in_flight);
            summary.passes += 1;
            summary.dispatched += dispatched.len() as u64;
            reap_finished(&mut in_flight);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {}
            }
        }

        summary.in_flight_at_stop = in_flight.len();
        self.shutdown(&mut in_flight).await;

        info!(
            passes = summary.passes,
            dispatched = summary.dispatched,
            in_flight = summary.in_flight_at_stop,
            "scheduler stopped"
        );
        Ok(summary)
    }

    /// Start the scheduling loop on a background tokio task.
    pub fn spawn(&self, cancel: CancellationToken) -> SchedulerHandle {
        let scheduler = self.clone();
        let session_cancel = cancel.clone();
        let handle = tokio::spawn(async move { scheduler.run(session_cancel).await });
        SchedulerHandle { handle, cancel }
    }

    /// Execute one scheduler pass: dispatch every due task.
    fn tick(&self, in_flight: &mut JoinSet<()>) -> Vec<String> {
        let due = self.take_due(Instant::now());

        let mut dispatched = Vec::with_capacity(due.len());
        for task in due {
            debug!(task = task.name(), priority = %task.priority(), "dispatching task");
            dispatched.push(task.name().to_owned());
            let scheduler = self.clone();
            // Created before spawning so an execution aborted before its
            // first poll still releases the task.
            let release = ReleaseOnDrop {
                tasks: Arc::clone(&self.tasks),
                id: task.id(),
                armed: true,
            };
            in_flight.spawn(async move { scheduler.execute_task(task, release).await });
        }
        dispatched
    }

    /// Collect due tasks and flag them running under a single lock.
    fn take_due(&self, now: Instant) -> Vec<ScheduledTask> {
        let mut due: Vec<ScheduledTask> = self
            .lock_tasks()
            .iter_mut()
            .filter(|t| t.is_due_at(now))
            .map(|t| {
                t.mark_running();
                t.clone()
            })
            .collect();
        sort_for_dispatch(&mut due);
        due
    }

    /// Execute a single task, isolating its failure from the loop.
    async fn execute_task(self, mut task: ScheduledTask, mut release: ReleaseOnDrop) {
        let started_at = Utc::now();
        let result = AssertUnwindSafe(task.execute()).catch_unwind().await;
        let finished_at = Utc::now();
        let finished = Instant::now();

        let (outcome, error) = match result {
            Ok(Ok(())) => (TaskRunOutcome::Success, None),
            Ok(Err(e)) => (TaskRunOutcome::Failed, Some(format!("{e:#}"))),
            Err(panic) => (TaskRunOutcome::Panicked, Some(panic_message(panic.as_ref()))),
        };

        if let Some(err) = &error {
            warn!(task = task.name(), error = %err, "task execution failed");
        } else {
            debug!(task = task.name(), "task execution finished");
        }

        release.armed = false;
        self.complete(
            task.id(),
            task.last_run().unwrap_or(finished),
            finished,
            error.as_deref(),
        );

        self.record(TaskRunRecord {
            task_name: task.name().to_owned(),
            priority: task.priority(),
            started_at,
            finished_at,
            outcome,
            error,
        });
    }

    /// Write an execution result back to the registered task, if still present.
    fn complete(&self, id: Uuid, completed_at: Instant, finished: Instant, error: Option<&str>) {
        let mut tasks = self.lock_tasks();
        let Some(task) = tasks.iter_mut().find(|t| t.id() == id) else {
            debug!(%id, "finished task is no longer registered");
            return;
        };

        match error {
            None => task.mark_run_success(completed_at),
            Some(err) => {
                let backoff = self
                    .config
                    .backoff_for(task.failure_streak().saturating_add(1));
                task.mark_run_failure(finished, err, backoff);
            }
        }
    }

    fn record(&self, run: TaskRunRecord) {
        {
            let mut history = self.lock_history();
            history.push_back(run.clone());
            let limit = self.config.history_limit.max(1);
            while history.len() > limit {
                history.pop_front();
            }
        }

        if let Some(tx) = &self.result_tx {
            if tx.send(run).is_err() {
                debug!("scheduler result channel closed");
            }
        }
    }

    /// Let in-flight executions finish or detach them.
    async fn shutdown(&self, in_flight: &mut JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }

        if self.config.drain_on_shutdown {
            let drain = async {
                while let Some(joined) = in_flight.join_next().await {
                    if let Err(e) = joined {
                        warn!("task execution did not complete: {e}");
                    }
                }
            };
            if tokio::time::timeout(self.config.drain_timeout(), drain)
                .await
                .is_err()
            {
                warn!(
                    remaining = in_flight.len(),
                    "drain timed out, leaving executions running"
                );
            }
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<ScheduledTask>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_history(&self) -> MutexGuard<'_, VecDeque<TaskRunRecord>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle to a run session started with [`Scheduler::spawn`].
#[derive(Debug)]
pub struct SchedulerHandle {
    handle: JoinHandle<Result<RunSummary>>,
    cancel: CancellationToken,
}

impl SchedulerHandle {
    /// Token that stops the session when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns `true` once the run loop has returned.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the session and wait for the run loop to return.
    ///
    /// # Errors
    ///
    /// Returns the session's own error, or [`SchedulerError::Join`] if the
    /// loop panicked or was aborted.
    pub async fn stop(self) -> Result<RunSummary> {
        self.cancel.cancel();
        self.wait().await
    }

    /// Wait for the run loop to return without cancelling it.
    ///
    /// # Errors
    ///
    /// Same as [`stop`](Self::stop).
    pub async fn wait(self) -> Result<RunSummary> {
        self.handle
            .await
            .map_err(|e| SchedulerError::Join(e.to_string()))?
    }
}

/// Executions dispatched by one loop or pass.
///
/// Dropping a bare `JoinSet` aborts its tasks, so the set is detached
/// instead, even when the owning future is dropped mid-run.
#[derive(Default)]
struct InFlight(JoinSet<()>);

impl std::ops::Deref for InFlight {
    type Target = JoinSet<()>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::ops::DerefMut for InFlight {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.detach_all();
    }
}

/// Returns a task to `Idle` if its execution is dropped before completing.
struct ReleaseOnDrop {
    tasks: Arc<Mutex<Vec<ScheduledTask>>>,
    id: Uuid,
    armed: bool,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = tasks.iter_mut().find(|t| t.id() == self.id) {
            task.release();
            debug!(task = task.name(), "execution dropped before completion");
        }
    }
}

/// Clears the running flag when a session ends, even by panic.
struct SessionGuard<'a>(&'a AtomicBool);

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Highest priority first; the sort is stable so ties keep registration order.
fn sort_for_dispatch(tasks: &mut [ScheduledTask]) {
    tasks.sort_by_key(|t| std::cmp::Reverse(t.priority()));
}

fn reap_finished(in_flight: &mut JoinSet<()>) {
    while let Some(joined) = in_flight.try_join_next() {
        if let Err(e) = joined {
            warn!("task execution did not complete: {e}");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panicked: {msg}")
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panicked: {msg}")
    } else {
        "panicked".to_owned()
    }
}
