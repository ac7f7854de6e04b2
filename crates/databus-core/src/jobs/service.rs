//! Persistent job records.

use std::sync::Arc;

use databus_db::DbPool;
use databus_types::{datetime_from_ms, JobRecord, JobSpec, JobStatus};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::clock::Clock;
use crate::error::BusError;

const JOB_COLUMNS: &str = "id, spec_json, status, cursor, processed, error, \
     created_at_ms, updated_at_ms, completed_at_ms";

/// Submission and status tracking for move and replay jobs.
///
/// Methods perform blocking storage calls.
pub trait JobService: Send + Sync + 'static {
    /// Persists a new job in `ACCEPTED` state and returns its record.
    fn submit(&self, spec: JobSpec) -> Result<JobRecord, BusError>;

    /// Returns the current record of a job.
    ///
    /// # Errors
    ///
    /// `UnknownJob` if no such job exists.
    fn status(&self, id: &str) -> Result<JobRecord, BusError>;

    /// Returns every job that has not reached a terminal state, oldest first.
    fn unfinished(&self) -> Result<Vec<JobRecord>, BusError>;

    fn mark_running(&self, id: &str) -> Result<(), BusError>;

    fn mark_complete(&self, id: &str) -> Result<(), BusError>;

    /// Marks a job failed. The cursor is left where the last successful
    /// batch put it.
    fn mark_failed(&self, id: &str, error: &str) -> Result<(), BusError>;

    /// Deletes terminal jobs completed before `before_ms`.
    fn prune_finished(&self, before_ms: i64) -> Result<usize, BusError>;
}

/// [`JobService`] backed by the `bus_jobs` table.
pub struct SqliteJobService {
    pool: DbPool,
    clock: Arc<dyn Clock>,
}

impl SqliteJobService {
    pub fn new(pool: DbPool, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }
}

impl JobService for SqliteJobService {
    fn submit(&self, spec: JobSpec) -> Result<JobRecord, BusError> {
        let conn = self.pool.get()?;
        insert_job(&conn, &spec, self.clock.now_ms())
    }

    fn status(&self, id: &str) -> Result<JobRecord, BusError> {
        let conn = self.pool.get()?;
        get_job(&conn, id)
    }

    fn unfinished(&self) -> Result<Vec<JobRecord>, BusError> {
        let conn = self.pool.get()?;
        list_unfinished(&conn)
    }

    fn mark_running(&self, id: &str) -> Result<(), BusError> {
        let conn = self.pool.get()?;
        set_status(&conn, id, JobStatus::Running, None, self.clock.now_ms())
    }

    fn mark_complete(&self, id: &str) -> Result<(), BusError> {
        let conn = self.pool.get()?;
        set_status(&conn, id, JobStatus::Complete, None, self.clock.now_ms())
    }

    fn mark_failed(&self, id: &str, error: &str) -> Result<(), BusError> {
        let conn = self.pool.get()?;
        set_status(&conn, id, JobStatus::Failed, Some(error), self.clock.now_ms())
    }

    fn prune_finished(&self, before_ms: i64) -> Result<usize, BusError> {
        let conn = self.pool.get()?;
        Ok(conn.execute(
            "DELETE FROM bus_jobs
             WHERE status IN ('COMPLETE', 'FAILED') AND completed_at_ms < ?1",
            [before_ms],
        )?)
    }
}

pub(crate) fn insert_job(
    conn: &Connection,
    spec: &JobSpec,
    now_ms: i64,
) -> Result<JobRecord, BusError> {
    let id = uuid::Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO bus_jobs (id, kind, spec_json, status, processed, created_at_ms, updated_at_ms)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
        params![
            id,
            spec.kind().as_str(),
            serde_json::to_string(spec)?,
            JobStatus::Accepted.as_str(),
            now_ms,
        ],
    )?;

    tracing::info!(job_id = %id, kind = %spec.kind(), "job accepted");

    Ok(JobRecord {
        id,
        spec: spec.clone(),
        status: JobStatus::Accepted,
        cursor: None,
        processed: 0,
        error: None,
        created_at: datetime_from_ms(now_ms),
        updated_at: datetime_from_ms(now_ms),
        completed_at: None,
    })
}

pub(crate) fn get_job(conn: &Connection, id: &str) -> Result<JobRecord, BusError> {
    let record = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM bus_jobs WHERE id = ?1"),
            [id],
            map_row_to_job,
        )
        .optional()?;
    record.ok_or_else(|| BusError::UnknownJob(id.to_string()))
}

fn list_unfinished(conn: &Connection) -> Result<Vec<JobRecord>, BusError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM bus_jobs
         WHERE status IN ('ACCEPTED', 'RUNNING')
         ORDER BY created_at_ms ASC, id ASC"
    ))?;
    let rows = stmt.query_map([], map_row_to_job)?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row?);
    }
    Ok(records)
}

fn set_status(
    conn: &Connection,
    id: &str,
    status: JobStatus,
    error: Option<&str>,
    now_ms: i64,
) -> Result<(), BusError> {
    let completed_at_ms = status.is_terminal().then_some(now_ms);
    let updated = conn.execute(
        "UPDATE bus_jobs
         SET status = ?2, error = ?3, updated_at_ms = ?4, completed_at_ms = ?5
         WHERE id = ?1",
        params![id, status.as_str(), error, now_ms, completed_at_ms],
    )?;
    if updated == 0 {
        return Err(BusError::UnknownJob(id.to_string()));
    }
    Ok(())
}

/// Reads the resumption cursor of a job.
pub(crate) fn job_cursor(conn: &Connection, id: &str) -> Result<Option<i64>, BusError> {
    let cursor = conn
        .query_row("SELECT cursor FROM bus_jobs WHERE id = ?1", [id], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .optional()?;
    cursor.ok_or_else(|| BusError::UnknownJob(id.to_string()))
}

/// Advances a job's cursor and processed count. Called inside the batch
/// transaction so progress commits together with the batch.
pub(crate) fn record_progress(
    conn: &Connection,
    id: &str,
    cursor: i64,
    processed: usize,
    now_ms: i64,
) -> Result<(), BusError> {
    conn.execute(
        "UPDATE bus_jobs
         SET cursor = ?2, processed = processed + ?3, updated_at_ms = ?4
         WHERE id = ?1",
        params![id, cursor, i64::try_from(processed).unwrap_or(i64::MAX), now_ms],
    )?;
    Ok(())
}

fn map_row_to_job(row: &Row) -> rusqlite::Result<JobRecord> {
    let spec_json: String = row.get(1)?;
    let spec: JobSpec = serde_json::from_str(&spec_json).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let status_str: String = row.get(2)?;
    let status: JobStatus = status_str.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let completed_at_ms: Option<i64> = row.get(8)?;

    Ok(JobRecord {
        id: row.get(0)?,
        spec,
        status,
        cursor: row.get(3)?,
        processed: u64::try_from(row.get::<_, i64>(4)?).unwrap_or_default(),
        error: row.get(5)?,
        created_at: datetime_from_ms(row.get(6)?),
        updated_at: datetime_from_ms(row.get(7)?),
        completed_at: completed_at_ms.map(datetime_from_ms),
    })
}
