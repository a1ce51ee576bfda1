pub mod envelope;
pub mod errors;
pub mod history;
pub mod ids;

pub use envelope::{EnvelopeError, EnvelopePayload, EventEnvelope, EventKind, StreamEvent};
pub use errors::GatewayError;
pub use history::{
    CatchUpRecord, EventLog, EventRecord, HistoryError, JobAggregateStore, JobSnapshot, ListOptions,
    ReplaySource,
};
pub use ids::{ConnectionId, EventId, JobId, JobIdError};
