use saga_core::HistoryError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("sequence out of range: {0}")]
    SequenceRange(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("background task failed: {0}")]
    Join(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Join(e.to_string())
    }
}

impl From<StoreError> for HistoryError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Serialization(msg) | StoreError::SequenceRange(msg) => HistoryError::Corrupt(msg),
            other => HistoryError::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialization_maps_to_corrupt() {
        let err: HistoryError = StoreError::Serialization("bad payload".into()).into();
        assert!(matches!(err, HistoryError::Corrupt(_)));
    }

    #[test]
    fn database_maps_to_unavailable() {
        let err: HistoryError = StoreError::Database("locked".into()).into();
        assert!(matches!(err, HistoryError::Unavailable(msg) if msg.contains("locked")));
    }
}
