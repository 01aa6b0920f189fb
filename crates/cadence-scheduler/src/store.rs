//! Durable-store seams consumed by the scheduling core.
//!
//! Both traits are synchronous: implementations are expected to be cheap
//! keyed lookups (the bundled implementations wrap a SQLite connection).

use cadence_core::types::JobId;

use crate::error::Result;
use crate::types::{ExecutionLogEntry, JobDefinition, JobQuery, LogQuery, Page, Pagination};

/// Durable store of job definitions.
pub trait JobStore: Send + Sync {
    /// Insert a new definition. Fails with `DuplicateJob` when the
    /// `(group, name)` key is taken.
    fn save(&self, def: &JobDefinition) -> Result<()>;

    fn find(&self, id: &JobId) -> Result<Option<JobDefinition>>;

    fn find_by_ids(&self, ids: &[JobId]) -> Result<Vec<JobDefinition>>;

    fn find_by_key(&self, name: &str, group: &str) -> Result<Option<JobDefinition>>;

    fn find_all_enabled(&self) -> Result<Vec<JobDefinition>>;

    /// Overwrite every mutable field of an existing definition.
    /// Returns `false` when no row matched.
    fn update(&self, def: &JobDefinition) -> Result<bool>;

    /// Returns `false` when no row matched.
    fn set_enabled(&self, id: &JobId, enabled: bool) -> Result<bool>;

    fn increment_run_count(&self, id: &JobId) -> Result<()>;

    /// Returns the number of rows actually deleted.
    fn delete(&self, ids: &[JobId]) -> Result<usize>;

    fn query(&self, criteria: &JobQuery, pagination: &Pagination) -> Result<Page<JobDefinition>>;
}

/// Append-only store of execution records.
pub trait LogStore: Send + Sync {
    fn append(&self, entry: &ExecutionLogEntry) -> Result<()>;

    /// Newest entries first.
    fn query(&self, criteria: &LogQuery, pagination: &Pagination)
        -> Result<Page<ExecutionLogEntry>>;
}
