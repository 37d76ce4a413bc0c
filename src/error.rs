//! Error types and result handling for journaled.
//!
//! This module defines the main error type [`Error`], the delivery-specific
//! [`DeliveryError`] raised by the delivery agent, and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use journaled::{Error, Result};
//!
//! fn check_event() -> Result<()> {
//!     Err(Error::ContractViolation("partition key is empty".to_string()))
//! }
//!
//! match check_event() {
//!     Ok(()) => println!("Valid"),
//!     Err(Error::ContractViolation(msg)) => eprintln!("Bad event: {}", msg),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// The main error type for journaled operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, typically from a missing or malformed setting.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The event does not provide the required journaling surface.
    ///
    /// This is a programmer error and is never retried.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// The serialized attributes failed the envelope or event-specific schema.
    #[error("Schema validation failed against '{schema}': {detail}")]
    SchemaValidation {
        /// Name of the schema that rejected the event
        schema: String,
        /// Violation detail reported by the validator
        detail: String,
    },

    /// No schema is registered under the requested name.
    #[error("Unknown schema: {0}")]
    UnknownSchema(String),

    /// The stream name variable for an application is not set.
    #[error("Stream name lookup failed: {variable} is not set")]
    StreamNameLookup {
        /// Environment variable that was consulted
        variable: String,
    },

    /// Delivering a batch to the stream failed.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    /// The job scheduler could not accept or run a task.
    #[error("Scheduler error: {0}")]
    Scheduler(String),

    /// PostgreSQL client error from the durable job queue.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding events or tasks.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from reading event files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Graceful shutdown was requested (e.g., via Ctrl+C).
    #[error("Shutdown requested")]
    Shutdown,
}

impl Error {
    /// Whether the job scheduler should run the failed work again.
    ///
    /// Validation and contract errors fail the same way on every attempt.
    /// A missing stream name is retried, since the variable may be set
    /// before the next attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Delivery(e) => e.is_retryable(),
            Error::StreamNameLookup { .. }
            | Error::Postgres(_)
            | Error::Kafka(_)
            | Error::Io(_) => true,
            _ => false,
        }
    }
}

/// Failures raised while delivering one batch to the stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The put-records call itself failed with a transient condition.
    ///
    /// The whole batch should be retried unchanged.
    #[error("Temporary transport failure: {kind}")]
    TemporaryTransportFailure {
        /// Classified transport condition, e.g. `ServiceUnavailable`
        kind: String,
    },

    /// The put-records call failed with a non-transient error such as
    /// missing permissions on the stream.
    #[error("Transport error {code}: {message}")]
    Transport {
        /// Error code reported by the transport
        code: String,
        /// Error message reported by the transport
        message: String,
    },

    /// The transport response contradicts itself.
    #[error("Protocol inconsistency: {0}")]
    ProtocolInconsistency(String),

    /// Every record was throttled by the stream.
    #[error("ALL records failed to be added to the stream (rate limited): {messages}")]
    RateLimitFailure {
        /// Rejection messages joined in record order
        messages: String,
    },

    /// Every record was rejected with a non-throttle error code.
    #[error("ALL records failed to be added to the stream ({code}): {messages}")]
    InternalRecordFailure {
        /// Shared error code of the grouped rejections
        code: String,
        /// Rejection messages joined in record order
        messages: String,
    },

    /// Every record was rejected, with more than one distinct error code.
    #[error("ALL records failed to be added to the stream with {} error codes: {}", .0.len(), join_causes(.0))]
    Aggregate(Vec<DeliveryError>),

    /// A batch kept partially failing past the configured requeue depth.
    #[error("Requeue limit of {limit} reached with {remaining} records still rejected")]
    RequeueLimitExceeded {
        /// Configured maximum requeue depth
        limit: u32,
        /// Number of records that were still rejected
        remaining: usize,
    },
}

impl DeliveryError {
    /// Whether the scheduler's standard retry policy applies.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeliveryError::TemporaryTransportFailure { .. }
            | DeliveryError::Transport { .. }
            | DeliveryError::RateLimitFailure { .. }
            | DeliveryError::InternalRecordFailure { .. } => true,
            DeliveryError::Aggregate(causes) => causes.iter().all(DeliveryError::is_retryable),
            DeliveryError::ProtocolInconsistency(_) | DeliveryError::RequeueLimitExceeded { .. } => {
                false
            }
        }
    }

    /// Whether this failure (or any bundled cause) is a throttle.
    pub fn is_rate_limited(&self) -> bool {
        match self {
            DeliveryError::RateLimitFailure { .. } => true,
            DeliveryError::Aggregate(causes) => causes.iter().any(DeliveryError::is_rate_limited),
            _ => false,
        }
    }
}

fn join_causes(causes: &[DeliveryError]) -> String {
    causes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" | ")
}

/// A convenient Result type alias for journaled operations.
///
/// This is equivalent to `std::result::Result<T, journaled::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
