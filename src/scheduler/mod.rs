//! Priority task scheduler.
//!
//! Holds named recurring tasks, each with a priority and a minimum re-run
//! interval, and periodically dispatches the due ones, highest priority
//! first, until cancelled.

pub mod runner;
pub mod tasks;

pub use runner::{RunSummary, Scheduler, SchedulerHandle, SchedulerState, StopReason};
pub use tasks::{
    ScheduledTask, TaskAction, TaskFuture, TaskPriority, TaskRunOutcome, TaskRunRecord, TaskState,
};
