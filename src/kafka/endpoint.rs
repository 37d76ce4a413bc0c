use async_trait::async_trait;
use futures::future::join_all;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, instrument};

use crate::config::KafkaConfig;
use crate::serializer::SerializedRecord;
use crate::stream::{
    PutRecordsOutput, RecordOutcome, StreamEndpoint, TemporaryKind, TransportError,
    PROVISIONED_THROUGHPUT_EXCEEDED,
};
use crate::{Error, Result};

/// A [`StreamEndpoint`] backed by a Kafka topic per stream name.
///
/// Partitions play the role of shards and offsets the role of sequence
/// numbers in the per-record outcomes.
pub struct KafkaStreamEndpoint {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl KafkaStreamEndpoint {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("linger.ms", config.linger_ms.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()
            .map_err(Error::Kafka)?;

        Ok(Self {
            producer,
            queue_timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }
}

#[async_trait]
impl StreamEndpoint for KafkaStreamEndpoint {
    #[instrument(skip(self, records), fields(records = records.len()))]
    async fn put_records(
        &self,
        stream_name: &str,
        records: &[SerializedRecord],
    ) -> std::result::Result<PutRecordsOutput, TransportError> {
        let sends = records.iter().map(|record| {
            let message = FutureRecord::to(stream_name)
                .payload(record.data.as_ref())
                .key(record.partition_key.as_str());
            self.producer
                .send(message, Timeout::After(self.queue_timeout))
        });

        let results = join_all(sends)
            .await
            .into_iter()
            .map(|result| result.map_err(|(e, _message)| e))
            .collect::<Vec<_>>();

        debug!(stream = stream_name, "Kafka produce round-trip finished");
        summarize(results)
    }
}

/// Folds per-message produce results into a put-records response.
///
/// When every message failed with a transient broker or network
/// condition, the call as a whole is reported as a temporary failure.
fn summarize(
    results: Vec<std::result::Result<(i32, i64), KafkaError>>,
) -> std::result::Result<PutRecordsOutput, TransportError> {
    if !results.is_empty() {
        let kinds: Vec<Option<TemporaryKind>> = results
            .iter()
            .map(|r| r.as_ref().err().and_then(temporary_kind))
            .collect();
        if kinds.iter().all(Option::is_some) {
            if let (Some(Some(kind)), Some(Err(first))) = (kinds.first(), results.first()) {
                return Err(TransportError::Temporary {
                    kind: *kind,
                    message: first.to_string(),
                });
            }
        }
    }

    let outcomes = results
        .into_iter()
        .map(|result| match result {
            Ok((partition, offset)) => RecordOutcome::accepted(partition.to_string(), offset.to_string()),
            Err(e) => {
                let (code, message) = rejection(&e);
                RecordOutcome::rejected(code, message)
            }
        })
        .collect();

    Ok(PutRecordsOutput::from_records(outcomes))
}

fn temporary_kind(error: &KafkaError) -> Option<TemporaryKind> {
    match error.rdkafka_error_code()? {
        RDKafkaErrorCode::AllBrokersDown
        | RDKafkaErrorCode::BrokerTransportFailure
        | RDKafkaErrorCode::NetworkException => Some(TemporaryKind::Networking),
        RDKafkaErrorCode::MessageTimedOut
        | RDKafkaErrorCode::RequestTimedOut
        | RDKafkaErrorCode::OperationTimedOut => Some(TemporaryKind::GatewayTimeout),
        RDKafkaErrorCode::BrokerNotAvailable
        | RDKafkaErrorCode::LeaderNotAvailable
        | RDKafkaErrorCode::NotLeaderForPartition => Some(TemporaryKind::ServiceUnavailable),
        RDKafkaErrorCode::NotEnoughReplicas | RDKafkaErrorCode::NotEnoughReplicasAfterAppend => {
            Some(TemporaryKind::InternalFailure)
        }
        _ => None,
    }
}

/// Error code and message for a rejected record. Local queue saturation
/// and broker quotas are reported as throughput throttling.
fn rejection(error: &KafkaError) -> (String, String) {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::QueueFull) | Some(RDKafkaErrorCode::ThrottlingQuotaExceeded) => {
            (PROVISIONED_THROUGHPUT_EXCEEDED.to_string(), error.to_string())
        }
        Some(code) => (format!("{:?}", code), error.to_string()),
        None => ("KafkaError".to_string(), error.to_string()),
    }
}
