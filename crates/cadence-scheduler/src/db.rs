use rusqlite::Connection;

use crate::error::Result;

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `jobs` and `job_logs` tables (idempotent). `jobs` carries a
/// unique `(job_group, name)` key; `job_logs` is indexed by job and start
/// time for the paginated log view.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS jobs (
            id                  TEXT    NOT NULL PRIMARY KEY,
            name                TEXT    NOT NULL,
            job_group           TEXT    NOT NULL,
            cron_expression     TEXT,               -- NULL for simple triggers
            interval_seconds    INTEGER,
            repeat_count        INTEGER,
            handler_assembly    TEXT    NOT NULL,
            handler_class       TEXT    NOT NULL,
            start_time          TEXT,               -- RFC 3339 or NULL
            end_time            TEXT,
            is_enabled          INTEGER NOT NULL DEFAULT 0,
            pause_after_failure INTEGER NOT NULL DEFAULT 0,
            run_params          TEXT    NOT NULL DEFAULT '',
            description         TEXT,
            principal           TEXT,
            alert_email         TEXT,
            run_count           INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT    NOT NULL,
            updated_at          TEXT    NOT NULL,
            UNIQUE (job_group, name)
        ) STRICT;

        -- Startup reconciliation: SELECT … WHERE is_enabled = 1
        CREATE INDEX IF NOT EXISTS idx_jobs_enabled ON jobs (is_enabled);

        CREATE TABLE IF NOT EXISTS job_logs (
            id           TEXT    NOT NULL PRIMARY KEY,
            job_id       TEXT    NOT NULL,
            job_name     TEXT    NOT NULL,
            job_group    TEXT    NOT NULL,
            handler      TEXT    NOT NULL,
            run_params   TEXT    NOT NULL,
            start_time   TEXT    NOT NULL,
            duration_ms  INTEGER NOT NULL,
            outcome      TEXT    NOT NULL,   -- success | failure | timeout
            error_detail TEXT
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_job_logs_job_start ON job_logs (job_id, start_time);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_db_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init_db(&conn).unwrap();
        init_db(&conn).unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('jobs', 'job_logs')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 2);
    }
}
