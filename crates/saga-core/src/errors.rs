use crate::ids::{ConnectionId, JobIdError};

/// Typed error hierarchy for the realtime gateway.
/// Classifies errors by which client-facing category they belong to.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum GatewayError {
    // Admission rejected
    #[error("gateway is at capacity ({limit} connections)")]
    ConnectionLimit { limit: usize },
    #[error("too many connections from origin {origin} (limit {limit})")]
    OriginLimit { origin: String, limit: usize },
    #[error("gateway is shutting down")]
    ShuttingDown,

    // Subscription rejected
    #[error("subscription limit reached ({limit} jobs per client)")]
    SubscriptionLimit { limit: usize },
    #[error("invalid job id: {0}")]
    InvalidJobId(#[from] JobIdError),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    // Internal, degraded
    #[error("replay degraded: {0}")]
    ReplayDegraded(String),
    #[error("malformed bus message: {0}")]
    MalformedBusMessage(String),

    // Client protocol
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    // Eviction
    #[error("connection closed after {idle_ms} ms without client activity")]
    IdleEvicted { idle_ms: u64 },
}

impl GatewayError {
    pub fn is_admission_rejection(&self) -> bool {
        matches!(
            self,
            Self::ConnectionLimit { .. } | Self::OriginLimit { .. } | Self::ShuttingDown
        )
    }

    pub fn is_subscription_rejection(&self) -> bool {
        matches!(
            self,
            Self::SubscriptionLimit { .. } | Self::InvalidJobId(_) | Self::UnknownConnection(_)
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ConnectionLimit { .. } => "connection_limit",
            Self::OriginLimit { .. } => "origin_limit",
            Self::ShuttingDown => "shutting_down",
            Self::SubscriptionLimit { .. } => "subscription_limit",
            Self::InvalidJobId(_) => "invalid_job_id",
            Self::UnknownConnection(_) => "unknown_connection",
            Self::ReplayDegraded(_) => "replay_degraded",
            Self::MalformedBusMessage(_) => "malformed_bus_message",
            Self::InvalidMessage(_) => "invalid_message",
            Self::IdleEvicted { .. } => "idle_evicted",
        }
    }

    /// Machine-readable code carried by the client `error` message.
    pub fn client_code(&self) -> &'static str {
        if self.is_admission_rejection() {
            "ADMISSION_REJECTED"
        } else if self.is_subscription_rejection() {
            "SUBSCRIPTION_REJECTED"
        } else {
            match self {
                Self::IdleEvicted { .. } => "IDLE_TIMEOUT",
                Self::InvalidMessage(_) => "INVALID_MESSAGE",
                _ => "INTERNAL_ERROR",
            }
        }
    }
}
