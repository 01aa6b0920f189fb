//! `cadence-core`: shared configuration, error and identity types.

pub mod config;
pub mod error;
pub mod types;

pub use config::{CadenceConfig, SchedulerConfig};
pub use error::{CadenceError, Result};
pub use types::{JobId, LogId};
