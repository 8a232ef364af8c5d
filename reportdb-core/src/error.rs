//! Error types for ReportDB

use thiserror::Error;

/// Result type alias for ReportDB operations
pub type Result<T> = std::result::Result<T, ReportError>;

/// ReportDB error types
#[derive(Error, Debug)]
pub enum ReportError {
    /// IO operation failed (open, mmap, truncate)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Index or configuration JSON could not be (de)serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Counter ID not present in the counter map
    #[error("unknown counter ID: {0}")]
    UnknownCounter(u16),

    /// Shard directory was never written
    #[error("engine {path} is not available")]
    EngineNotAvailable { path: String },

    /// No index entry for the object in this shard
    #[error("no data for object {object_id}")]
    NoDataForObject { object_id: u32 },

    /// Requested range does not overlap the recorded span
    #[error("range {from}-{to} not covered for object {object_id}")]
    RangeNotCovered { object_id: u32, from: u32, to: u32 },

    /// Query merged to an empty result
    #[error("no data found in time range {from}-{to}")]
    NoDataInRange { from: u32, to: u32 },

    /// Histogram would need more buckets than allowed
    #[error("query spans {buckets} buckets, at most {max} allowed")]
    TooManyBuckets { buckets: u64, max: u64 },

    /// Query exceeded its deadline
    #[error("query timeout")]
    Timeout,

    /// Value does not match the counter's declared type
    #[error("invalid {expected} value for counter {counter_id}")]
    TypeMismatch { counter_id: u16, expected: &'static str },

    /// Stored bytes could not be decoded
    #[error("decode error: {0}")]
    Decode(String),

    /// Offset or length points outside the mapped region
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Timestamp older than the object's last indexed sample
    #[error("out-of-order write for object {object_id}: last {last}, got {got}")]
    OutOfOrder { object_id: u32, last: u32, got: u32 },

    /// A pipeline queue was closed
    #[error("queue closed: {0}")]
    QueueClosed(&'static str),

    /// A response waiter is already registered for this request
    #[error("duplicate request ID: {0}")]
    DuplicateRequest(u64),

    /// Process is shutting down
    #[error("server shutdown")]
    Shutdown,
}

impl ReportError {
    /// Expected absence of data, never an I/O failure
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ReportError::NoDataForObject { .. }
                | ReportError::RangeNotCovered { .. }
                | ReportError::NoDataInRange { .. }
                | ReportError::EngineNotAvailable { .. }
        )
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, ReportError::Corruption(_) | ReportError::Decode(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_distinct_from_io() {
        let missing = ReportError::NoDataForObject { object_id: 7 };
        assert!(missing.is_not_found());
        assert!(!missing.is_corruption());

        let io = ReportError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(!io.is_not_found());
    }

    #[test]
    fn test_messages() {
        let err = ReportError::NoDataInRange { from: 10, to: 20 };
        assert_eq!(err.to_string(), "no data found in time range 10-20");
        assert_eq!(ReportError::Timeout.to_string(), "query timeout");
    }
}
