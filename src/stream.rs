//! The stream side of delivery: the put-records capability and stream name
//! resolution per logical application.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

use crate::serializer::SerializedRecord;
use crate::{Error, Result};

/// Error code a stream uses to reject a record for exceeding throughput.
pub const PROVISIONED_THROUGHPUT_EXCEEDED: &str = "ProvisionedThroughputExceededException";

/// Per-record result of a put-records call, in request order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Accepted {
        shard_id: String,
        sequence_number: String,
    },
    Rejected {
        error_code: String,
        error_message: String,
    },
}

impl RecordOutcome {
    pub fn accepted(shard_id: impl Into<String>, sequence_number: impl Into<String>) -> Self {
        RecordOutcome::Accepted {
            shard_id: shard_id.into(),
            sequence_number: sequence_number.into(),
        }
    }

    pub fn rejected(error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        RecordOutcome::Rejected {
            error_code: error_code.into(),
            error_message: error_message.into(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, RecordOutcome::Rejected { .. })
    }
}

/// Response of a put-records call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRecordsOutput {
    /// Number of rejected records as reported by the stream.
    pub failed_record_count: usize,
    pub records: Vec<RecordOutcome>,
}

impl PutRecordsOutput {
    /// Builds a response whose failed count agrees with its records.
    pub fn from_records(records: Vec<RecordOutcome>) -> Self {
        let failed_record_count = records.iter().filter(|r| r.is_rejected()).count();
        Self {
            failed_record_count,
            records,
        }
    }
}

/// Transient conditions under which a whole batch is retried unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporaryKind {
    InternalFailure,
    ServiceUnavailable,
    GatewayTimeout,
    Networking,
}

impl TemporaryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemporaryKind::InternalFailure => "InternalFailure",
            TemporaryKind::ServiceUnavailable => "ServiceUnavailable",
            TemporaryKind::GatewayTimeout => "GatewayTimeout",
            TemporaryKind::Networking => "NetworkingError",
        }
    }

    /// Server-side conditions, as opposed to failures reaching the server.
    pub fn is_server_error(&self) -> bool {
        !matches!(self, TemporaryKind::Networking)
    }
}

impl fmt::Display for TemporaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of the put-records call itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{kind}: {message}")]
    Temporary { kind: TemporaryKind, message: String },

    #[error("{code}: {message}")]
    Fatal { code: String, message: String },
}

/// A stream that accepts batches of records.
///
/// Implementations own credentials, connection handling and the call
/// deadline; an expired deadline is reported as
/// [`TemporaryKind::GatewayTimeout`] or [`TemporaryKind::Networking`].
#[async_trait]
pub trait StreamEndpoint: Send + Sync {
    /// Submits `records` in one call, preserving their order.
    async fn put_records(
        &self,
        stream_name: &str,
        records: &[SerializedRecord],
    ) -> std::result::Result<PutRecordsOutput, TransportError>;
}

/// Maps a logical application name to its stream.
pub trait StreamNameResolver: Send + Sync {
    fn resolve_stream_name(&self, app_name: Option<&str>) -> Result<String>;
}

/// Name of the variable holding the stream for `app_name`:
/// `MY_APP_JOURNALED_STREAM_NAME`, or `JOURNALED_STREAM_NAME` without one.
pub fn stream_env_var_name(app_name: Option<&str>) -> String {
    match app_name {
        Some(app) if !app.is_empty() => format!("{}_JOURNALED_STREAM_NAME", app.to_uppercase()),
        _ => "JOURNALED_STREAM_NAME".to_string(),
    }
}

/// Resolves stream names from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvStreamNames;

impl StreamNameResolver for EnvStreamNames {
    fn resolve_stream_name(&self, app_name: Option<&str>) -> Result<String> {
        let variable = stream_env_var_name(app_name);
        match std::env::var(&variable) {
            Ok(name) if !name.is_empty() => Ok(name),
            _ => Err(Error::StreamNameLookup { variable }),
        }
    }
}

/// Resolves stream names from a fixed table keyed by variable name.
#[derive(Debug, Clone, Default)]
pub struct StaticStreamNames {
    names: HashMap<String, String>,
}

impl StaticStreamNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stream(mut self, app_name: Option<&str>, stream_name: impl Into<String>) -> Self {
        self.names
            .insert(stream_env_var_name(app_name), stream_name.into());
        self
    }
}

impl StreamNameResolver for StaticStreamNames {
    fn resolve_stream_name(&self, app_name: Option<&str>) -> Result<String> {
        let variable = stream_env_var_name(app_name);
        self.names
            .get(&variable)
            .cloned()
            .ok_or(Error::StreamNameLookup { variable })
    }
}
