//! Sending one delivery task to the stream and reconciling the response.
//!
//! Outcomes of [`DeliveryAgent::deliver`]:
//!
//! - delivery disabled: success without contacting the stream
//! - temporary transport failure: [`DeliveryError::TemporaryTransportFailure`],
//!   the scheduler retries the whole task unchanged
//! - inconsistent response: [`DeliveryError::ProtocolInconsistency`], never retried
//! - every record rejected: one error per distinct error code (bundled in
//!   [`DeliveryError::Aggregate`] when there are several), no requeue
//! - some records rejected: exactly those records are enqueued as a new task
//! - nothing rejected: success

use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::DeliveryError;
use crate::event::EnqueueOptions;
use crate::scheduler::{DeliveryTask, JobScheduler};
use crate::serializer::SerializedRecord;
use crate::stream::{
    PutRecordsOutput, RecordOutcome, StreamEndpoint, StreamNameResolver, TransportError,
    PROVISIONED_THROUGHPUT_EXCEEDED,
};
use crate::Result;

/// What a successful delivery did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryReport {
    /// Delivery is switched off; nothing was sent.
    Disabled,
    /// Every record was accepted.
    Delivered { records: usize },
    /// Some records were accepted; the rest went into a follow-up task.
    Requeued { accepted: usize, requeued: usize },
}

/// Result of checking a put-records response against its request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    Delivered,
    /// The rejected records, in request order.
    PartiallyRejected(Vec<SerializedRecord>),
}

pub struct DeliveryAgent {
    endpoint: Arc<dyn StreamEndpoint>,
    stream_names: Arc<dyn StreamNameResolver>,
    scheduler: Arc<dyn JobScheduler>,
    config: Arc<Config>,
}

impl DeliveryAgent {
    pub fn new(
        endpoint: Arc<dyn StreamEndpoint>,
        stream_names: Arc<dyn StreamNameResolver>,
        scheduler: Arc<dyn JobScheduler>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            endpoint,
            stream_names,
            scheduler,
            config,
        }
    }

    #[instrument(
        skip(self, task),
        fields(app_name = ?task.app_name, records = task.len(), depth = task.requeue_depth)
    )]
    pub async fn deliver(&self, task: &DeliveryTask) -> Result<DeliveryReport> {
        if !self.config.delivery_enabled() {
            debug!("Delivery disabled, skipping");
            return Ok(DeliveryReport::Disabled);
        }

        if task.is_empty() {
            return Ok(DeliveryReport::Delivered { records: 0 });
        }

        let stream_name = self
            .stream_names
            .resolve_stream_name(task.app_name.as_deref())?;

        let output = match self.endpoint.put_records(&stream_name, &task.records).await {
            Ok(output) => output,
            Err(e) => return Err(transport_failure(e).into()),
        };

        match reconcile(&task.records, &output)? {
            Reconciliation::Delivered => {
                debug!(stream = %stream_name, "All records accepted");
                Ok(DeliveryReport::Delivered {
                    records: task.len(),
                })
            }
            Reconciliation::PartiallyRejected(rejected) => {
                let requeued = rejected.len();
                let accepted = task.len() - requeued;

                if task.requeue_depth >= self.config.max_requeue_depth {
                    error!(
                        stream = %stream_name,
                        failed = requeued,
                        "Requeue limit reached, giving up on rejected records"
                    );
                    return Err(DeliveryError::RequeueLimitExceeded {
                        limit: self.config.max_requeue_depth,
                        remaining: requeued,
                    }
                    .into());
                }

                warn!(
                    stream = %stream_name,
                    accepted,
                    failed = requeued,
                    "Some records were rejected, requeuing them"
                );
                self.scheduler
                    .enqueue(
                        task.requeue(rejected),
                        EnqueueOptions::default().resolve(&self.config),
                    )
                    .await?;

                info!(accepted, requeued, "Partial delivery requeued");
                Ok(DeliveryReport::Requeued { accepted, requeued })
            }
        }
    }
}

fn transport_failure(error: TransportError) -> DeliveryError {
    match error {
        TransportError::Temporary { kind, message } => {
            if kind.is_server_error() {
                error!(detail = %message, "Stream error - Server error occurred - {}", kind);
            } else {
                error!(detail = %message, "Stream error - Networking error occurred - {}", kind);
            }
            DeliveryError::TemporaryTransportFailure {
                kind: kind.to_string(),
            }
        }
        TransportError::Fatal { code, message } => {
            error!(code = %code, "Stream error - {}", message);
            DeliveryError::Transport { code, message }
        }
    }
}

/// Checks a put-records response against the records that were sent.
///
/// Fails with [`DeliveryError::ProtocolInconsistency`] when the response
/// contradicts itself, and with the grouped rejection errors when every
/// record was rejected.
pub fn reconcile(
    records: &[SerializedRecord],
    output: &PutRecordsOutput,
) -> std::result::Result<Reconciliation, DeliveryError> {
    if output.records.len() != records.len() {
        return Err(DeliveryError::ProtocolInconsistency(format!(
            "response carries {} outcomes for {} submitted records",
            output.records.len(),
            records.len()
        )));
    }

    let rejected: Vec<&RecordOutcome> = output.records.iter().filter(|r| r.is_rejected()).collect();

    if rejected.len() != output.failed_record_count {
        return Err(DeliveryError::ProtocolInconsistency(format!(
            "FailedRecordCount differs from count of records that have errors (reported {}, found {})",
            output.failed_record_count,
            rejected.len()
        )));
    }

    if rejected.is_empty() {
        return Ok(Reconciliation::Delivered);
    }

    if rejected.len() == records.len() {
        return Err(group_rejections(&rejected));
    }

    let retry = records
        .iter()
        .zip(&output.records)
        .filter(|(_, outcome)| outcome.is_rejected())
        .map(|(record, _)| record.clone())
        .collect();

    Ok(Reconciliation::PartiallyRejected(retry))
}

/// One error per distinct error code, in order of first appearance.
fn group_rejections(rejected: &[&RecordOutcome]) -> DeliveryError {
    let mut groups: Vec<(&str, Vec<&str>)> = Vec::new();

    for outcome in rejected {
        if let RecordOutcome::Rejected {
            error_code,
            error_message,
        } = outcome
        {
            match groups.iter_mut().find(|(code, _)| *code == error_code.as_str()) {
                Some((_, messages)) => messages.push(error_message.as_str()),
                None => groups.push((error_code.as_str(), vec![error_message.as_str()])),
            }
        }
    }

    let mut errors: Vec<DeliveryError> = groups
        .into_iter()
        .map(|(code, messages)| {
            let messages = messages.join("; ");
            if code == PROVISIONED_THROUGHPUT_EXCEEDED {
                DeliveryError::RateLimitFailure { messages }
            } else {
                DeliveryError::InternalRecordFailure {
                    code: code.to_string(),
                    messages,
                }
            }
        })
        .collect();

    if errors.len() == 1 {
        errors.remove(0)
    } else {
        DeliveryError::Aggregate(errors)
    }
}
