use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::OptionalExtension;
use tracing::instrument;

use saga_core::{
    EnvelopePayload, EventEnvelope, EventId, EventLog, EventRecord, HistoryError, JobId,
    ListOptions,
};

use crate::database::Database;
use crate::error::StoreError;

/// Fixed-width timestamp so that text ordering in SQLite matches time ordering.
pub(crate) fn encode_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn decode_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("timestamp {s:?}: {e}")))
}

/// An event to be appended to a job's log.
#[derive(Clone, Debug)]
pub struct NewEvent {
    pub job_id: JobId,
    /// Explicit sequence; the next free one is assigned when `None`.
    pub sequence: Option<u64>,
    /// Emission time for job-status payloads, which carry none of their own.
    pub occurred_at: Option<DateTime<Utc>>,
    pub payload: EnvelopePayload,
}

impl NewEvent {
    pub fn from_envelope(envelope: &EventEnvelope) -> Self {
        Self {
            job_id: envelope.job_id.clone(),
            sequence: envelope.sequence,
            occurred_at: None,
            payload: envelope.payload.clone(),
        }
    }

    fn emission_time(&self) -> DateTime<Utc> {
        match &self.payload {
            EnvelopePayload::Generation { event } | EnvelopePayload::Domain { event } => {
                event.occurred_at
            }
            EnvelopePayload::JobStatus { .. } => self.occurred_at.unwrap_or_else(Utc::now),
        }
    }

    fn event_type(&self) -> &str {
        match &self.payload {
            EnvelopePayload::Generation { event } | EnvelopePayload::Domain { event } => {
                &event.event_type
            }
            EnvelopePayload::JobStatus { status, .. } => status,
        }
    }
}

/// SQLite-backed per-job event log.
#[derive(Clone)]
pub struct EventLogRepo {
    db: Database,
}

impl EventLogRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Append an event. The sequence is checked and assigned inside one
    /// transaction, so concurrent appends for a job never share a number.
    #[instrument(skip(self, event), fields(job_id = %event.job_id))]
    pub fn append(&self, event: NewEvent) -> Result<EventRecord, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let sequence = match event.sequence {
                Some(seq) => seq,
                None => {
                    let max: Option<i64> = tx.query_row(
                        "SELECT MAX(sequence) FROM events WHERE job_id = ?1",
                        [event.job_id.as_str()],
                        |row| row.get(0),
                    )?;
                    match max {
                        Some(m) => loaded_sequence(m)?.checked_add(1).ok_or_else(|| {
                            StoreError::SequenceRange(format!("sequence {m} cannot be advanced"))
                        })?,
                        None => 1,
                    }
                }
            };
            let stored = stored_sequence(sequence)?;

            let id = EventId::new();
            let occurred_at = event.emission_time();
            let kind = event.payload.kind();
            tx.execute(
                "INSERT INTO events (id, job_id, sequence, kind, event_type, occurred_at, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    id.as_str(),
                    event.job_id.as_str(),
                    stored,
                    kind.as_str(),
                    event.event_type(),
                    encode_time(&occurred_at),
                    serde_json::to_string(&event.payload)?,
                    encode_time(&Utc::now()),
                ],
            )
            .map_err(|e| match e {
                rusqlite::Error::SqliteFailure(f, _)
                    if f.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    StoreError::Database(format!(
                        "sequence {sequence} already used for job {}",
                        event.job_id
                    ))
                }
                other => other.into(),
            })?;
            tx.commit()?;

            Ok(EventRecord {
                id,
                job_id: event.job_id.clone(),
                sequence,
                occurred_at,
                payload: event.payload.clone(),
            })
        })
    }

    /// List a job's events ascending by emission time (sequence breaks ties).
    /// With a limit, the most recent `limit` events are returned.
    #[instrument(skip(self, options), fields(job_id = %job_id))]
    pub fn list_sync(
        &self,
        job_id: &JobId,
        options: &ListOptions,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.db.with_conn(|conn| list_events(conn, job_id, options))
    }

    /// Highest sequence recorded for a job.
    pub fn last_sequence(&self, job_id: &JobId) -> Result<Option<u64>, StoreError> {
        self.db.with_conn(|conn| {
            let max: Option<i64> = conn
                .query_row(
                    "SELECT MAX(sequence) FROM events WHERE job_id = ?1",
                    [job_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?
                .flatten();
            max.map(loaded_sequence).transpose()
        })
    }

    pub fn count(&self, job_id: &JobId) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM events WHERE job_id = ?1",
                [job_id.as_str()],
                |row| row.get(0),
            )?)
        })
    }
}

fn list_events(
    conn: &rusqlite::Connection,
    job_id: &JobId,
    options: &ListOptions,
) -> Result<Vec<EventRecord>, StoreError> {
    let limit: i64 = options.limit.map_or(-1, i64::from);
    let before = options.before.as_ref().map(encode_time);
    let mut stmt = conn.prepare_cached(
        "SELECT id, job_id, sequence, occurred_at, payload
         FROM events
         WHERE job_id = ?1 AND (?2 IS NULL OR occurred_at < ?2)
         ORDER BY occurred_at DESC, sequence DESC
         LIMIT ?3",
    )?;
    let mut rows = stmt.query(rusqlite::params![job_id.as_str(), before, limit])?;
    let mut results = Vec::new();
    while let Some(row) = rows.next()? {
        results.push(row_to_record(row)?);
    }
    results.reverse();
    Ok(results)
}

/// SQLite integers are signed; sequences above `i64::MAX` cannot be stored.
fn stored_sequence(sequence: u64) -> Result<i64, StoreError> {
    i64::try_from(sequence)
        .map_err(|_| StoreError::SequenceRange(format!("{sequence} exceeds the storable maximum")))
}

fn loaded_sequence(raw: i64) -> Result<u64, StoreError> {
    u64::try_from(raw).map_err(|_| StoreError::SequenceRange(format!("stored sequence {raw} is negative")))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<EventRecord, StoreError> {
    let id: String = row.get(0)?;
    let job_id: String = row.get(1)?;
    let sequence: i64 = row.get(2)?;
    let occurred_at: String = row.get(3)?;
    let payload: String = row.get(4)?;
    Ok(EventRecord {
        id: EventId::from_raw(id),
        job_id: JobId::parse(&job_id)
            .map_err(|e| StoreError::Serialization(format!("job id {job_id:?}: {e}")))?,
        sequence: loaded_sequence(sequence)?,
        occurred_at: decode_time(&occurred_at)?,
        payload: serde_json::from_str(&payload)?,
    })
}

#[async_trait]
impl EventLog for EventLogRepo {
    async fn list(
        &self,
        job_id: &JobId,
        options: ListOptions,
    ) -> Result<Vec<EventRecord>, HistoryError> {
        let job_id = job_id.clone();
        let records = self
            .db
            .run_blocking(move |conn| list_events(conn, &job_id, &options))
            .await?;
        Ok(records)
    }
}
