//! In-memory stand-ins for the stream, for tests and dry runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::serializer::SerializedRecord;
use crate::stream::{PutRecordsOutput, RecordOutcome, StreamEndpoint, TransportError};

type Scripted = std::result::Result<PutRecordsOutput, TransportError>;

/// A [`StreamEndpoint`] that replays queued responses in order and records
/// every call. Once the script runs out, every record is accepted.
#[derive(Debug, Default)]
pub struct ScriptedEndpoint {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<(String, Vec<SerializedRecord>)>>,
}

impl ScriptedEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, output: PutRecordsOutput) -> Self {
        lock(&self.script).push_back(Ok(output));
        self
    }

    pub fn fail(self, error: TransportError) -> Self {
        lock(&self.script).push_back(Err(error));
        self
    }

    /// Every `(stream_name, records)` pair submitted so far.
    pub fn calls(&self) -> Vec<(String, Vec<SerializedRecord>)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl StreamEndpoint for ScriptedEndpoint {
    async fn put_records(
        &self,
        stream_name: &str,
        records: &[SerializedRecord],
    ) -> std::result::Result<PutRecordsOutput, TransportError> {
        lock(&self.calls).push((stream_name.to_string(), records.to_vec()));

        match lock(&self.script).pop_front() {
            Some(scripted) => scripted,
            None => Ok(PutRecordsOutput::from_records(
                (0..records.len())
                    .map(|i| RecordOutcome::accepted("shardId-000000000000", i.to_string()))
                    .collect(),
            )),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
