//! Client-facing wire protocol.

use std::sync::Arc;

use saga_core::{EnvelopePayload, EventEnvelope, GatewayError, JobId, StreamEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames a client may send.
///
/// Job ids stay raw here so that a bad id is a subscription rejection rather
/// than an unparsable frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Subscribe { job_id: String },
    Unsubscribe { job_id: String },
    Ping,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text).map_err(|e| GatewayError::InvalidMessage(e.to_string()))
    }
}

/// Frames the gateway sends.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Subscribed {
        job_id: JobId,
    },
    Unsubscribed {
        job_id: JobId,
    },
    GenerationEvent {
        job_id: JobId,
        event: StreamEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
        #[serde(default, skip_serializing_if = "is_false")]
        replay: bool,
    },
    DomainEvent {
        job_id: JobId,
        event: StreamEvent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
        #[serde(default, skip_serializing_if = "is_false")]
        replay: bool,
    },
    JobStatus {
        job_id: JobId,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
        #[serde(default, skip_serializing_if = "is_false")]
        replay: bool,
    },
    Pong,
    Error {
        code: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<String>,
    },
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl ServerMessage {
    /// Route an envelope to the channel matching its kind.
    pub fn from_envelope(envelope: &EventEnvelope, replay: bool) -> Self {
        let job_id = envelope.job_id.clone();
        let sequence = envelope.sequence;
        match &envelope.payload {
            EnvelopePayload::Generation { event } => Self::GenerationEvent {
                job_id,
                event: event.clone(),
                sequence,
                replay,
            },
            EnvelopePayload::Domain { event } => Self::DomainEvent {
                job_id,
                event: event.clone(),
                sequence,
                replay,
            },
            EnvelopePayload::JobStatus { status, snapshot } => Self::JobStatus {
                job_id,
                status: status.clone(),
                snapshot: snapshot.clone(),
                sequence,
                replay,
            },
        }
    }

    pub fn error(err: &GatewayError, job_id: Option<&str>) -> Self {
        Self::Error {
            code: err.client_code().to_string(),
            message: err.to_string(),
            job_id: job_id.map(str::to_string),
        }
    }

    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Subscribed { .. } => "subscribed",
            Self::Unsubscribed { .. } => "unsubscribed",
            Self::GenerationEvent { .. } => "generation-event",
            Self::DomainEvent { .. } => "domain-event",
            Self::JobStatus { .. } => "job-status",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_frame(&self) -> Result<Arc<String>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::new)
    }
}
