//! Persisted job history as the gateway sees it, and the collaborator traits
//! that serve it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::envelope::{EnvelopePayload, EventEnvelope, EventKind, ENVELOPE_VERSION};
use crate::ids::{EventId, JobId};

/// One event from a job's persisted log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: EventId,
    pub job_id: JobId,
    pub sequence: u64,
    pub occurred_at: DateTime<Utc>,
    pub payload: EnvelopePayload,
}

impl EventRecord {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Rebuild the envelope this record was persisted from.
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope {
            version: ENVELOPE_VERSION,
            job_id: self.job_id.clone(),
            sequence: Some(self.sequence),
            payload: self.payload.clone(),
        }
    }
}

/// Paging options for [`EventLog::list`].
#[derive(Clone, Debug, Default)]
pub struct ListOptions {
    /// Keep only the most recent `limit` records.
    pub limit: Option<u32>,
    /// Keep only records that occurred strictly before this instant.
    pub before: Option<DateTime<Utc>>,
}

/// Point-in-time view of a job's aggregate state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    /// Synthesize the job-status envelope a late subscriber receives when the
    /// job has no persisted events.
    pub fn to_status_envelope(&self) -> EventEnvelope {
        let mut snapshot = json!({
            "updatedAt": self.updated_at,
        });
        if let Some(progress) = self.progress {
            snapshot["progress"] = json!(progress);
        }
        if let Some(detail) = &self.detail {
            snapshot["detail"] = detail.clone();
        }
        EventEnvelope::new(
            self.job_id.clone(),
            EnvelopePayload::JobStatus {
                status: self.status.clone(),
                snapshot: Some(snapshot),
            },
        )
    }
}

/// Where a catch-up replay got its data from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplaySource {
    Events,
    Aggregate,
    None,
}

impl ReplaySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Aggregate => "aggregate",
            Self::None => "none",
        }
    }
}

/// Outcome of the latest catch-up for a job. One per job, overwritten.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchUpRecord {
    pub job_id: JobId,
    pub replayed_events: usize,
    pub replay_source: ReplaySource,
    pub replay_duration_ms: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history backend unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt history record: {0}")]
    Corrupt(String),
}

/// Read side of the per-job event log.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Records for `job_id`, ascending by emission time.
    async fn list(
        &self,
        job_id: &JobId,
        options: ListOptions,
    ) -> Result<Vec<EventRecord>, HistoryError>;
}

/// Source of job aggregate snapshots.
#[async_trait]
pub trait JobAggregateStore: Send + Sync {
    async fn find(&self, job_id: &JobId) -> Result<Option<JobSnapshot>, HistoryError>;
}
