use async_trait::async_trait;
use rusqlite::OptionalExtension;

use saga_core::{HistoryError, JobAggregateStore, JobId, JobSnapshot};

use crate::database::Database;
use crate::error::StoreError;
use crate::events::{decode_time, encode_time};

/// Aggregate view of each job's latest status.
#[derive(Clone)]
pub struct JobRepo {
    db: Database,
}

impl JobRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace the snapshot for a job. Older snapshots never
    /// overwrite newer ones.
    pub fn upsert(&self, snapshot: &JobSnapshot) -> Result<(), StoreError> {
        let detail = snapshot.detail.as_ref().map(serde_json::to_string).transpose()?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO jobs (job_id, status, progress, detail, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(job_id) DO UPDATE SET
                    status = excluded.status,
                    progress = excluded.progress,
                    detail = excluded.detail,
                    updated_at = excluded.updated_at
                 WHERE excluded.updated_at >= jobs.updated_at",
                rusqlite::params![
                    snapshot.job_id.as_str(),
                    snapshot.status,
                    snapshot.progress,
                    detail,
                    encode_time(&snapshot.updated_at),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get(&self, job_id: &JobId) -> Result<Option<JobSnapshot>, StoreError> {
        self.db.with_conn(|conn| find_job(conn, job_id))
    }

    pub fn delete(&self, job_id: &JobId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let n = conn.execute("DELETE FROM jobs WHERE job_id = ?1", [job_id.as_str()])?;
            Ok(n > 0)
        })
    }
}

fn find_job(conn: &rusqlite::Connection, job_id: &JobId) -> Result<Option<JobSnapshot>, StoreError> {
    let row = conn
        .query_row(
            "SELECT status, progress, detail, updated_at FROM jobs WHERE job_id = ?1",
            [job_id.as_str()],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<f64>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((status, progress, detail, updated_at)) = row else {
        return Ok(None);
    };
    Ok(Some(JobSnapshot {
        job_id: job_id.clone(),
        status,
        progress,
        detail: detail
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()?,
        updated_at: decode_time(&updated_at)?,
    }))
}

#[async_trait]
impl JobAggregateStore for JobRepo {
    async fn find(&self, job_id: &JobId) -> Result<Option<JobSnapshot>, HistoryError> {
        let job_id = job_id.clone();
        Ok(self.db.run_blocking(move |conn| find_job(conn, &job_id)).await?)
    }
}
