//! Domain error types for the Kafka writer.
//!
//! Uses `thiserror` for ergonomic error definitions with proper context.

use thiserror::Error;

/// Errors related to configuration parsing and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// At least one broker address is required.
    #[error("brokers must contain at least one address")]
    NoBrokers,

    /// The topic name is required.
    #[error("topic must not be empty")]
    EmptyTopic,

    /// A numeric limit that must be positive was zero.
    #[error("{field} must be at least 1, got {value}")]
    ZeroLimit { field: &'static str, value: u64 },

    /// Only acks=1 and acks=-1 produce a response the writer can wait on.
    #[error("required_acks must be 1 or -1, got {0}")]
    InvalidRequiredAcks(i16),

    /// Failed to read configuration file.
    #[error("failed to read config file '{path}': {source}")]
    IoError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML configuration.
    #[error("failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    /// Invalid address format.
    #[error("invalid address format: {0} (expected 'host:port')")]
    InvalidAddress(String),
}

/// Errors that occur while writing messages.
#[derive(Error, Debug)]
pub enum WriterError {
    /// A single message is larger than the configured batch byte limit.
    #[error("message of {size} bytes exceeds batch_bytes limit of {max}")]
    OversizeMessage { size: u64, max: u64 },

    /// Every retry of a flush failed.
    #[error("failed to write to partition {partition} after {retries} retries: {cause}")]
    DeliveryExhausted {
        partition: i32,
        retries: u32,
        cause: String,
    },

    /// The caller's deadline expired before all messages resolved.
    #[error("deadline exceeded while waiting for delivery")]
    DeadlineExceeded,

    /// TCP/IO connection error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// Broker is not reachable or the connection was dropped.
    #[error("broker {address} unavailable: {message}")]
    BrokerUnavailable { address: String, message: String },

    /// No configured broker could be reached.
    #[error("no brokers available")]
    NoBrokersAvailable,

    /// A single produce write did not complete within the write timeout.
    #[error("write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    /// Failed to decode Kafka protocol message.
    #[error("protocol decode error: {message}")]
    ProtocolDecode { message: String },

    /// Failed to encode Kafka protocol message.
    #[error("protocol encode error: {message}")]
    ProtocolEncode { message: String },

    /// Request correlation ID mismatch.
    #[error("correlation ID mismatch: expected {expected}, got {actual}")]
    CorrelationIdMismatch { expected: i32, actual: i32 },

    /// The broker answered with a non-zero error code.
    #[error("broker rejected write to partition {partition} with error code {error_code}")]
    BrokerRejected { partition: i32, error_code: i16 },

    /// Topic was not found in metadata.
    #[error("topic not found: {topic}")]
    TopicNotFound { topic: String },

    /// The topic exists but reported no partitions.
    #[error("topic {topic} has no partitions")]
    NoPartitions { topic: String },

    /// A message named a partition the writer does not know about.
    #[error("partition {partition} is not a known partition of topic {topic}")]
    UnknownPartition { topic: String, partition: i32 },

    /// No leader is currently assigned to the partition.
    #[error("no leader available for partition {partition} of topic {topic}")]
    LeaderNotAvailable { topic: String, partition: i32 },

    /// The writer has been closed.
    #[error("writer closed")]
    WriterClosed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl WriterError {
    /// Whether the failure means the connection can no longer be trusted.
    ///
    /// A connection-level failure always forces a redial before the next
    /// attempt, whatever retry policy is configured.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::BrokerUnavailable { .. }
                | Self::NoBrokersAvailable
                | Self::WriteTimeout(_)
                | Self::CorrelationIdMismatch { .. }
                | Self::ProtocolDecode { .. }
                | Self::LeaderNotAvailable { .. }
        )
    }
}

/// Result type alias for writer operations.
pub type Result<T> = std::result::Result<T, WriterError>;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::ZeroLimit {
            field: "batch_size",
            value: 0,
        };
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_delivery_exhausted_keeps_cause() {
        let err = WriterError::DeliveryExhausted {
            partition: 3,
            retries: 5,
            cause: "bad attempt".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("bad attempt"));
        assert!(text.contains("partition 3"));
        assert!(text.contains("5 retries"));
    }

    #[test]
    fn test_writer_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "test");
        let err: WriterError = io_err.into();
        assert!(matches!(err, WriterError::Connection(_)));
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_broker_rejection_is_not_connection_level() {
        let err = WriterError::BrokerRejected {
            partition: 0,
            error_code: 6,
        };
        assert!(!err.is_connection_error());
        assert!(WriterError::WriteTimeout(Duration::from_secs(1)).is_connection_error());
    }

    #[test]
    fn test_writer_error_from_config() {
        let err: WriterError = ConfigError::EmptyTopic.into();
        assert!(matches!(err, WriterError::Config(ConfigError::EmptyTopic)));
    }
}
