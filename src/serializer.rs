use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::event::JournalableEvent;
use crate::schema::{SchemaRegistry, ValidatedEvent};
use crate::Result;

/// One stream record: the JSON payload of a validated event and its
/// partition key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedRecord {
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
    pub partition_key: String,
}

impl SerializedRecord {
    pub fn new(data: impl Into<Bytes>, partition_key: impl Into<String>) -> Self {
        Self {
            data: data.into(),
            partition_key: partition_key.into(),
        }
    }
}

/// Encodes a validated event. Pure; the payload is not re-validated.
pub fn serialize(event: &ValidatedEvent) -> Result<SerializedRecord> {
    let data = serde_json::to_vec(event.document())?;
    Ok(SerializedRecord::new(data, event.partition_key()))
}

/// Validates and serializes events against a shared schema registry.
#[derive(Clone)]
pub struct Serializer {
    registry: Arc<SchemaRegistry>,
}

impl Serializer {
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn validate<E: JournalableEvent + ?Sized>(&self, event: &E) -> Result<ValidatedEvent> {
        self.registry.validate(event)
    }

    pub fn serialize_event<E: JournalableEvent + ?Sized>(&self, event: &E) -> Result<SerializedRecord> {
        let validated = self.validate(event)?;
        serialize(&validated)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
