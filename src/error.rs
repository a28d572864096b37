use thiserror::Error;

/// Main error type for term buffer operations
#[derive(Error, Debug)]
pub enum BufferError {
    #[error("Invalid fact: {0}")]
    InvalidFact(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Buffer is shutting down - no new entries accepted")]
    ShuttingDown,

    #[error("Invalid capacity: cannot change capacity from {current} to {requested}")]
    InvalidCapacity { current: usize, requested: usize },

    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("Consistency failure: {0}")]
    ConsistencyFailure(String),

    #[error("Crawl state error: {0}")]
    CrawlState(String),

    #[error("Recovery write failure: {0}")]
    RecoveryWriteFailure(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Result type alias for term buffer operations
pub type Result<T> = std::result::Result<T, BufferError>;

impl BufferError {
    /// Check if this error indicates a transient failure that a later flush may get past
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            BufferError::SinkUnavailable(_) | BufferError::Timeout(_) | BufferError::Io(_)
        )
    }

    /// Errors that indicate a control-flow bug or lost bookkeeping rather than bad input
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BufferError::InvariantViolation(_) | BufferError::ConsistencyFailure(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BufferError::InvalidFact("can't have a null page".to_string());
        assert_eq!(err.to_string(), "Invalid fact: can't have a null page");

        let err = BufferError::InvalidCapacity {
            current: 0,
            requested: 100,
        };
        assert_eq!(
            err.to_string(),
            "Invalid capacity: cannot change capacity from 0 to 100"
        );
    }

    #[test]
    fn test_retriable_errors() {
        assert!(BufferError::SinkUnavailable("down".to_string()).is_retriable());
        assert!(BufferError::Timeout("idle".to_string()).is_retriable());
        assert!(!BufferError::ShuttingDown.is_retriable());
        assert!(!BufferError::InvariantViolation("twice".to_string()).is_retriable());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(BufferError::InvariantViolation("twice".to_string()).is_fatal());
        assert!(BufferError::ConsistencyFailure("status".to_string()).is_fatal());
        assert!(!BufferError::SinkUnavailable("down".to_string()).is_fatal());
    }
}
