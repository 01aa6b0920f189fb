//! SQLite-backed [`JobStore`] and [`LogStore`].
//!
//! Each store wraps its own connection in a `Mutex`; open one connection per
//! store against the same database file.

use std::sync::{Mutex, MutexGuard};

use cadence_core::types::{JobId, LogId};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params_from_iter, types::Value, Connection, ErrorCode, Row};
use tracing::{debug, instrument, warn};

use crate::db::init_db;
use crate::error::{Result, SchedulerError};
use crate::store::{JobStore, LogStore};
use crate::types::{
    ExecutionLogEntry, JobDefinition, JobQuery, LogQuery, Outcome, Page, Pagination,
};

const JOB_COLUMNS: &str = "id, name, job_group, cron_expression, interval_seconds, repeat_count,
     handler_assembly, handler_class, start_time, end_time, is_enabled,
     pause_after_failure, run_params, description, principal, alert_email,
     run_count, created_at, updated_at";

const LOG_COLUMNS: &str = "id, job_id, job_name, job_group, handler, run_params,
     start_time, duration_ms, outcome, error_detail";

pub struct SqliteJobStore {
    db: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        lock(&self.db)
    }

    fn select_where(&self, clause: &str, values: Vec<Value>) -> Result<Vec<JobDefinition>> {
        let db = self.conn()?;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM jobs WHERE {} ORDER BY created_at, id",
            JOB_COLUMNS, clause
        ))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_job)?;
        Ok(skip_bad_rows(rows, "jobs"))
    }
}

impl JobStore for SqliteJobStore {
    #[instrument(skip(self, def), fields(job_id = %def.id, name = %def.name))]
    fn save(&self, def: &JobDefinition) -> Result<()> {
        let db = self.conn()?;
        let res = db.execute(
            "INSERT INTO jobs
             (id, name, job_group, cron_expression, interval_seconds, repeat_count,
              handler_assembly, handler_class, start_time, end_time, is_enabled,
              pause_after_failure, run_params, description, principal, alert_email,
              run_count, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19)",
            rusqlite::params![
                def.id.as_str(),
                def.name,
                def.group,
                def.cron_expression,
                def.interval_seconds,
                def.repeat_count,
                def.handler_assembly,
                def.handler_class,
                def.start_time.as_ref().map(ts),
                def.end_time.as_ref().map(ts),
                def.is_enabled,
                def.pause_after_failure,
                def.run_params,
                def.description,
                def.principal,
                def.alert_email,
                def.run_count,
                ts(&def.created_at),
                ts(&def.updated_at),
            ],
        );
        map_constraint(res, def)?;
        debug!("job saved");
        Ok(())
    }

    fn find(&self, id: &JobId) -> Result<Option<JobDefinition>> {
        let db = self.conn()?;
        match db.query_row(
            &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
            [id.as_str()],
            row_to_job,
        ) {
            Ok(def) => Ok(Some(def)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn find_by_ids(&self, ids: &[JobId]) -> Result<Vec<JobDefinition>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let values = ids.iter().map(|id| Value::Text(id.0.clone())).collect();
        self.select_where(&format!("id IN ({})", placeholders(ids.len())), values)
    }

    fn find_by_key(&self, name: &str, group: &str) -> Result<Option<JobDefinition>> {
        let db = self.conn()?;
        match db.query_row(
            &format!(
                "SELECT {} FROM jobs WHERE name = ?1 AND job_group = ?2",
                JOB_COLUMNS
            ),
            [name, group],
            row_to_job,
        ) {
            Ok(def) => Ok(Some(def)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn find_all_enabled(&self) -> Result<Vec<JobDefinition>> {
        self.select_where("is_enabled = 1", Vec::new())
    }

    #[instrument(skip(self, def), fields(job_id = %def.id))]
    fn update(&self, def: &JobDefinition) -> Result<bool> {
        let db = self.conn()?;
        let res = db.execute(
            "UPDATE jobs SET
                name = ?2, job_group = ?3, cron_expression = ?4, interval_seconds = ?5,
                repeat_count = ?6, handler_assembly = ?7, handler_class = ?8,
                start_time = ?9, end_time = ?10, is_enabled = ?11,
                pause_after_failure = ?12, run_params = ?13, description = ?14,
                principal = ?15, alert_email = ?16, updated_at = ?17
             WHERE id = ?1",
            rusqlite::params![
                def.id.as_str(),
                def.name,
                def.group,
                def.cron_expression,
                def.interval_seconds,
                def.repeat_count,
                def.handler_assembly,
                def.handler_class,
                def.start_time.as_ref().map(ts),
                def.end_time.as_ref().map(ts),
                def.is_enabled,
                def.pause_after_failure,
                def.run_params,
                def.description,
                def.principal,
                def.alert_email,
                ts(&def.updated_at),
            ],
        );
        Ok(map_constraint(res, def)? > 0)
    }

    #[instrument(skip(self), fields(job_id = %id))]
    fn set_enabled(&self, id: &JobId, enabled: bool) -> Result<bool> {
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE jobs SET is_enabled = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![enabled, ts(&Utc::now()), id.as_str()],
        )?;
        Ok(n > 0)
    }

    fn increment_run_count(&self, id: &JobId) -> Result<()> {
        let db = self.conn()?;
        db.execute(
            "UPDATE jobs SET run_count = run_count + 1 WHERE id = ?1",
            [id.as_str()],
        )?;
        Ok(())
    }

    #[instrument(skip(self), fields(count = ids.len()))]
    fn delete(&self, ids: &[JobId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let db = self.conn()?;
        let values: Vec<Value> = ids.iter().map(|id| Value::Text(id.0.clone())).collect();
        let n = db.execute(
            &format!("DELETE FROM jobs WHERE id IN ({})", placeholders(ids.len())),
            params_from_iter(values.iter()),
        )?;
        Ok(n)
    }

    fn query(&self, criteria: &JobQuery, pagination: &Pagination) -> Result<Page<JobDefinition>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(name) = criteria.name.as_deref().filter(|n| !n.is_empty()) {
            clauses.push("name LIKE ?");
            values.push(Value::Text(format!("%{name}%")));
        }
        if let Some(group) = criteria.group.as_deref().filter(|g| !g.is_empty()) {
            clauses.push("job_group = ?");
            values.push(Value::Text(group.to_string()));
        }
        if let Some(enabled) = criteria.enabled {
            clauses.push("is_enabled = ?");
            values.push(Value::Integer(enabled as i64));
        }

        let db = self.conn()?;
        let where_sql = where_clause(&clauses);
        let total: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM jobs{}", where_sql),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        values.push(Value::Integer(pagination.limit()));
        values.push(Value::Integer(pagination.offset()));
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM jobs{} ORDER BY created_at, id LIMIT ? OFFSET ?",
            JOB_COLUMNS, where_sql
        ))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_job)?;
        Ok(Page {
            items: skip_bad_rows(rows, "jobs"),
            total: total as u64,
        })
    }
}

pub struct SqliteLogStore {
    db: Mutex<Connection>,
}

impl SqliteLogStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }
}

impl LogStore for SqliteLogStore {
    fn append(&self, entry: &ExecutionLogEntry) -> Result<()> {
        let db = lock(&self.db)?;
        db.execute(
            "INSERT INTO job_logs
             (id, job_id, job_name, job_group, handler, run_params,
              start_time, duration_ms, outcome, error_detail)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            rusqlite::params![
                entry.id.as_str(),
                entry.job_id.as_str(),
                entry.job_name,
                entry.job_group,
                entry.handler,
                entry.run_params,
                ts(&entry.start_time),
                entry.duration_ms as i64,
                entry.outcome.as_str(),
                entry.error_detail,
            ],
        )?;
        Ok(())
    }

    fn query(
        &self,
        criteria: &LogQuery,
        pagination: &Pagination,
    ) -> Result<Page<ExecutionLogEntry>> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(job_id) = &criteria.job_id {
            clauses.push("job_id = ?");
            values.push(Value::Text(job_id.0.clone()));
        }
        if let Some(outcome) = criteria.outcome {
            clauses.push("outcome = ?");
            values.push(Value::Text(outcome.as_str().to_string()));
        }
        if let Some(after) = &criteria.started_after {
            clauses.push("start_time >= ?");
            values.push(Value::Text(ts(after)));
        }
        if let Some(before) = &criteria.started_before {
            clauses.push("start_time < ?");
            values.push(Value::Text(ts(before)));
        }

        let db = lock(&self.db)?;
        let where_sql = where_clause(&clauses);
        let total: i64 = db.query_row(
            &format!("SELECT COUNT(*) FROM job_logs{}", where_sql),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        values.push(Value::Integer(pagination.limit()));
        values.push(Value::Integer(pagination.offset()));
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM job_logs{} ORDER BY start_time DESC, id DESC LIMIT ? OFFSET ?",
            LOG_COLUMNS, where_sql
        ))?;
        let rows = stmt.query_map(params_from_iter(values.iter()), row_to_log)?;
        Ok(Page {
            items: skip_bad_rows(rows, "job_logs"),
            total: total as u64,
        })
    }
}

// --- private helpers -------------------------------------------------------

fn lock(db: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|_| SchedulerError::StoreUnavailable("connection mutex poisoned".to_string()))
}

/// Fixed-width RFC 3339 so lexical order in SQLite matches time order.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_opt_ts(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| parse_ts(idx, &s)).transpose()
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobDefinition> {
    Ok(JobDefinition {
        id: JobId(row.get(0)?),
        name: row.get(1)?,
        group: row.get(2)?,
        cron_expression: row.get(3)?,
        interval_seconds: row.get(4)?,
        repeat_count: row.get(5)?,
        handler_assembly: row.get(6)?,
        handler_class: row.get(7)?,
        start_time: parse_opt_ts(8, row.get(8)?)?,
        end_time: parse_opt_ts(9, row.get(9)?)?,
        is_enabled: row.get(10)?,
        pause_after_failure: row.get(11)?,
        run_params: row.get(12)?,
        description: row.get(13)?,
        principal: row.get(14)?,
        alert_email: row.get(15)?,
        run_count: row.get(16)?,
        created_at: parse_ts(17, &row.get::<_, String>(17)?)?,
        updated_at: parse_ts(18, &row.get::<_, String>(18)?)?,
    })
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<ExecutionLogEntry> {
    let outcome: String = row.get(8)?;
    Ok(ExecutionLogEntry {
        id: LogId(row.get(0)?),
        job_id: JobId(row.get(1)?),
        job_name: row.get(2)?,
        job_group: row.get(3)?,
        handler: row.get(4)?,
        run_params: row.get(5)?,
        start_time: parse_ts(6, &row.get::<_, String>(6)?)?,
        duration_ms: row.get::<_, i64>(7)?.max(0) as u64,
        outcome: outcome.parse::<Outcome>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                8,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?,
        error_detail: row.get(9)?,
    })
}

/// Collect mapped rows, logging and skipping any that fail to decode so one
/// corrupt record cannot hide the rest.
fn skip_bad_rows<T>(rows: impl Iterator<Item = rusqlite::Result<T>>, table: &str) -> Vec<T> {
    rows.filter_map(|r| match r {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(%table, error = %e, "skipping undecodable row");
            None
        }
    })
    .collect()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

fn where_clause(clauses: &[&str]) -> String {
    if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    }
}

fn map_constraint(res: rusqlite::Result<usize>, def: &JobDefinition) -> Result<usize> {
    match res {
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
            Err(SchedulerError::DuplicateJob {
                name: def.name.clone(),
                group: def.group.clone(),
            })
        }
        other => Ok(other?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job_store() -> SqliteJobStore {
        SqliteJobStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn log_store() -> SqliteLogStore {
        SqliteLogStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn def(name: &str) -> JobDefinition {
        JobDefinition::new(name, "default", "Cadence.Jobs", "ConsoleWriteJob").with_interval(60, -1)
    }

    fn entry(job_id: &JobId, outcome: Outcome, start: DateTime<Utc>) -> ExecutionLogEntry {
        ExecutionLogEntry {
            id: LogId::new(),
            job_id: job_id.clone(),
            job_name: "report".into(),
            job_group: "default".into(),
            handler: "Cadence.Jobs/ConsoleWriteJob".into(),
            run_params: String::new(),
            start_time: start,
            duration_ms: 12,
            outcome,
            error_detail: None,
        }
    }

    #[test]
    fn save_and_find_round_trip() {
        let store = job_store();
        let mut job = def("report")
            .with_window(Some(Utc::now()), None)
            .with_params(r#"{"to":"ops"}"#);
        job.alert_email = Some("ops@example.com".into());
        store.save(&job).unwrap();

        let loaded = store.find(&job.id).unwrap().unwrap();
        assert_eq!(loaded.name, "report");
        assert_eq!(loaded.interval_seconds, Some(60));
        assert_eq!(loaded.repeat_count, Some(-1));
        assert_eq!(loaded.run_params, r#"{"to":"ops"}"#);
        assert_eq!(loaded.alert_email.as_deref(), Some("ops@example.com"));
        assert_eq!(
            loaded.start_time.map(|t| t.timestamp_micros()),
            job.start_time.map(|t| t.timestamp_micros())
        );
        assert!(store.find(&JobId::new()).unwrap().is_none());
    }

    #[test]
    fn duplicate_name_in_group_is_rejected() {
        let store = job_store();
        store.save(&def("report")).unwrap();
        let err = store.save(&def("report")).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateJob { .. }));

        let mut other_group = def("report");
        other_group.group = "billing".into();
        store.save(&other_group).unwrap();
    }

    #[test]
    fn enabled_filter_and_set_enabled() {
        let store = job_store();
        let a = def("a").enabled(true);
        let b = def("b");
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let enabled = store.find_all_enabled().unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].id, a.id);

        assert!(store.set_enabled(&b.id, true).unwrap());
        assert_eq!(store.find_all_enabled().unwrap().len(), 2);
        assert!(!store.set_enabled(&JobId::new(), true).unwrap());
    }

    #[test]
    fn update_keeps_run_count_and_reports_missing_rows() {
        let store = job_store();
        let mut job = def("report");
        store.save(&job).unwrap();
        store.increment_run_count(&job.id).unwrap();
        store.increment_run_count(&job.id).unwrap();

        job.cron_expression = Some("0 0 * * * *".into());
        job.interval_seconds = None;
        assert!(store.update(&job).unwrap());

        let loaded = store.find(&job.id).unwrap().unwrap();
        assert_eq!(loaded.run_count, 2);
        assert_eq!(loaded.cron_expression.as_deref(), Some("0 0 * * * *"));

        let ghost = def("ghost");
        assert!(!store.update(&ghost).unwrap());
    }

    #[test]
    fn delete_counts_only_existing_rows() {
        let store = job_store();
        let a = def("a");
        let b = def("b");
        store.save(&a).unwrap();
        store.save(&b).unwrap();

        let n = store.delete(&[a.id.clone(), JobId::new()]).unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.find_by_ids(&[a.id, b.id.clone()]).unwrap().len(), 1);
        assert_eq!(store.delete(&[]).unwrap(), 0);
    }

    #[test]
    fn query_filters_and_paginates() {
        let store = job_store();
        for i in 0..5 {
            store.save(&def(&format!("cleanup-{i}"))).unwrap();
        }
        store.save(&def("report").enabled(true)).unwrap();

        let page = store
            .query(
                &JobQuery {
                    name: Some("cleanup".into()),
                    ..Default::default()
                },
                &Pagination::new(2, 2),
            )
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.len(), 2);

        let enabled = store
            .query(
                &JobQuery {
                    enabled: Some(true),
                    ..Default::default()
                },
                &Pagination::default(),
            )
            .unwrap();
        assert_eq!(enabled.total, 1);
        assert_eq!(enabled.items[0].name, "report");
    }

    #[test]
    fn log_query_filters_by_job_outcome_and_time() {
        let store = log_store();
        let job = JobId::new();
        let other = JobId::new();
        let t0 = Utc::now() - Duration::hours(3);
        store.append(&entry(&job, Outcome::Success, t0)).unwrap();
        store
            .append(&entry(&job, Outcome::Failure, t0 + Duration::hours(1)))
            .unwrap();
        store
            .append(&entry(&job, Outcome::Timeout, t0 + Duration::hours(2)))
            .unwrap();
        store.append(&entry(&other, Outcome::Failure, t0)).unwrap();

        let all = store
            .query(
                &LogQuery {
                    job_id: Some(job.clone()),
                    ..Default::default()
                },
                &Pagination::default(),
            )
            .unwrap();
        assert_eq!(all.total, 3);
        // newest first
        assert_eq!(all.items[0].outcome, Outcome::Timeout);

        let failures = store
            .query(
                &LogQuery {
                    outcome: Some(Outcome::Failure),
                    ..Default::default()
                },
                &Pagination::default(),
            )
            .unwrap();
        assert_eq!(failures.total, 2);

        let recent = store
            .query(
                &LogQuery {
                    job_id: Some(job),
                    started_after: Some(t0 + Duration::minutes(30)),
                    started_before: Some(t0 + Duration::minutes(90)),
                    ..Default::default()
                },
                &Pagination::default(),
            )
            .unwrap();
        assert_eq!(recent.total, 1);
        assert_eq!(recent.items[0].outcome, Outcome::Failure);
    }
}
