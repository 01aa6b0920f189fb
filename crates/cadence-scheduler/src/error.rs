use cadence_core::types::JobId;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::TriggerState;

/// A job definition that cannot be turned into a trigger plan.
///
/// Raised before any persistence or engine mutation takes place.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("job has neither a cron expression nor a positive interval")]
    MissingTriggerSpec,

    #[error("invalid trigger spec: {0}")]
    InvalidTriggerSpec(String),

    #[error("invalid time window: end {end} is before start {start}")]
    InvalidTimeWindow {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("required field is empty: {0}")]
    MissingField(&'static str),
}

/// Errors that can occur within the scheduling core.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The engine already holds a live trigger for this job.
    #[error("Job {id} already has a live trigger")]
    AlreadyArmed { id: JobId },

    /// `execute` was called for a job that is still armed.
    #[error("Job {id} is already running, refusing to start it twice")]
    AlreadyRunning { id: JobId },

    /// Engine-level state machine misuse (e.g. pausing a job that is not armed).
    #[error("Cannot {action} job {id}: trigger is {from}")]
    InvalidStateTransition {
        id: JobId,
        from: TriggerState,
        action: &'static str,
    },

    /// User-facing form of `InvalidStateTransition` returned by the center.
    #[error("Job {id} is {current}, it cannot be {action}d in its current state")]
    WrongState {
        id: JobId,
        current: TriggerState,
        action: &'static str,
    },

    #[error("Job not found: {id}")]
    JobNotFound { id: JobId },

    #[error("A job named '{name}' already exists in group '{group}'")]
    DuplicateJob { name: String, group: String },

    #[error("No handler registered for {key}")]
    HandlerNotFound { key: String },

    #[error("Execution exceeded its budget of {ms}ms")]
    Timeout { ms: u64 },

    #[error("Handler failed: {0}")]
    HandlerFailure(String),

    /// Durable store I/O failure.
    #[error("Job store unavailable: {0}")]
    StoreUnavailable(String),
}

impl SchedulerError {
    /// Stable error kind reported alongside the reason string.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "VALIDATION_ERROR",
            SchedulerError::AlreadyArmed { .. } => "ALREADY_ARMED",
            SchedulerError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            SchedulerError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            SchedulerError::WrongState { .. } => "WRONG_STATE",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::DuplicateJob { .. } => "DUPLICATE_JOB",
            SchedulerError::HandlerNotFound { .. } => "HANDLER_NOT_FOUND",
            SchedulerError::Timeout { .. } => "TIMEOUT",
            SchedulerError::HandlerFailure(_) => "HANDLER_FAILURE",
            SchedulerError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        }
    }
}

impl From<rusqlite::Error> for SchedulerError {
    fn from(e: rusqlite::Error) -> Self {
        SchedulerError::StoreUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
