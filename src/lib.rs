//! tickwork: priority-ordered recurring task scheduler.
//!
//! Tasks are registered with a [`TaskPriority`] and a minimum interval
//! between runs. A [`Scheduler`] run loop wakes once per tick, dispatches
//! every due task as its own tokio task (highest priority first), and
//! stops when its cancellation token fires.
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tickwork::{ScheduledTask, Scheduler, TaskPriority};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo() -> tickwork::Result<()> {
//! let scheduler = Scheduler::new();
//! scheduler.add_task(ScheduledTask::new(
//!     "heartbeat",
//!     TaskPriority::High,
//!     Duration::from_secs(2),
//!     || async { Ok(()) },
//! ))?;
//!
//! let cancel = CancellationToken::new();
//! let handle = scheduler.spawn(cancel.clone());
//! tokio::time::sleep(Duration::from_secs(10)).await;
//! let summary = handle.stop().await?;
//! println!("{} passes", summary.passes);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod scheduler;

pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use scheduler::{
    RunSummary, ScheduledTask, Scheduler, SchedulerHandle, SchedulerState, StopReason,
    TaskPriority, TaskRunOutcome, TaskRunRecord, TaskState,
};
