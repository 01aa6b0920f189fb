//! `cadence-scheduler`: dynamic job scheduling with SQLite persistence.
//!
//! # Overview
//!
//! Job definitions live in a durable [`store::JobStore`]. The
//! [`center::SchedulerCenter`] is the only entry point for lifecycle
//! commands: it validates a definition through the [`planner`], persists it,
//! and arms a live trigger in the in-memory [`engine::SchedulerEngine`]. When
//! a trigger fires, the [`executor::JobExecutor`] runs the registered handler
//! under a time budget and appends one [`types::ExecutionLogEntry`].
//!
//! # Trigger modes
//!
//! | Mode     | Definition fields                   | Behaviour                                  |
//! |----------|-------------------------------------|--------------------------------------------|
//! | Cron     | `cron_expression`                   | Fires on every cron instant in the window  |
//! | Simple   | `interval_seconds`, `repeat_count`  | Fires now, then every interval, N+1 times  |
//!
//! Live trigger state is never persisted: on startup the center re-arms every
//! job whose `is_enabled` flag is set.

pub mod center;
pub mod clock;
pub mod db;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod planner;
pub mod registry;
pub mod sqlite;
pub mod store;
pub mod types;

pub use center::{ReconcileReport, SchedulerCenter};
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{EngineEvent, FireEvent, SchedulerEngine};
pub use error::{Result, SchedulerError, ValidationError};
pub use registry::{handler_fn, HandlerKey, HandlerRegistry, JobContext, JobHandler};
pub use sqlite::{SqliteJobStore, SqliteLogStore};
pub use store::{JobStore, LogStore};
pub use types::{
    ExecutionLogEntry, JobDefinition, JobQuery, JobView, LogQuery, Outcome, Page, Pagination,
    TriggerState,
};
