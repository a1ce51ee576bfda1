use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::JobId;

/// Highest envelope version this build understands.
pub const ENVELOPE_VERSION: u32 = 1;

/// Discriminant of an envelope. Each kind has its own client-facing channel.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Generation,
    Domain,
    JobStatus,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generation => "generation",
            Self::Domain => "domain",
            Self::JobStatus => "job-status",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A generation or domain event as emitted by a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl StreamEvent {
    pub fn new(event_type: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_type: event_type.into(),
            occurred_at,
            data: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Kind-specific body of an envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum EnvelopePayload {
    Generation {
        event: StreamEvent,
    },
    Domain {
        event: StreamEvent,
    },
    JobStatus {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<Value>,
    },
}

impl EnvelopePayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Generation { .. } => EventKind::Generation,
            Self::Domain { .. } => EventKind::Domain,
            Self::JobStatus { .. } => EventKind::JobStatus,
        }
    }
}

/// Versioned wire structure published on the bus by generation workers.
///
/// Decoded and validated once, at the bus boundary, by [`EventEnvelope::decode`].
/// Everything downstream works with the typed variant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub version: u32,
    pub job_id: JobId,
    /// Per-job monotonic sequence assigned by the producer, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(flatten)]
    pub payload: EnvelopePayload,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported envelope version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid envelope: {0}")]
    Invalid(String),
}

impl EventEnvelope {
    pub fn new(job_id: JobId, payload: EnvelopePayload) -> Self {
        Self {
            version: ENVELOPE_VERSION,
            job_id,
            sequence: None,
            payload,
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Parse and validate a raw bus payload.
    pub fn decode(raw: &str) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_str(raw)?;
        envelope.validate()?;
        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        if self.version == 0 || self.version > ENVELOPE_VERSION {
            return Err(EnvelopeError::UnsupportedVersion(self.version));
        }
        match &self.payload {
            EnvelopePayload::Generation { event } | EnvelopePayload::Domain { event } => {
                if event.event_type.trim().is_empty() {
                    return Err(EnvelopeError::Invalid("event type is empty".into()));
                }
            }
            EnvelopePayload::JobStatus { status, .. } => {
                if status.trim().is_empty() {
                    return Err(EnvelopeError::Invalid("job status is empty".into()));
                }
            }
        }
        Ok(())
    }
}
