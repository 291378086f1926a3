//! Error types for the tickwork scheduler.

/// Top-level error type for scheduler registration, sessions and config.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// A task with the same name is already registered.
    #[error("duplicate task: {0}")]
    DuplicateTask(String),

    /// A run session is already active on this scheduler.
    #[error("scheduler is already running")]
    AlreadyRunning,

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Background session task failed to join.
    #[error("join error: {0}")]
    Join(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SchedulerError>;
