//! The journaling surface every event exposes.
//!
//! Statically typed producers implement [`JournalableEvent`] directly.
//! Dynamic sources (JSON files, other processes) deserialize into a
//! [`RawEvent`], which is checked for completeness when converted into a
//! [`JournalEvent`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::Config;
use crate::key_strategy::KeyStrategy;
use crate::{Error, Result};

/// Structured attributes of one event, serialized as a JSON object.
pub type Attributes = Map<String, Value>;

/// Accessors the journaling pipeline needs from an event.
pub trait JournalableEvent {
    /// Name of the schema the attributes must satisfy.
    fn journaled_schema_name(&self) -> String;

    /// Stream partition key; records sharing a key keep their relative order.
    fn journaled_partition_key(&self) -> String;

    fn journaled_attributes(&self) -> Attributes;

    /// Logical application whose stream receives the event.
    fn journaled_app_name(&self) -> Option<String> {
        None
    }

    fn journaled_enqueue_opts(&self) -> EnqueueOptions {
        EnqueueOptions::default()
    }
}

impl<T: JournalableEvent + ?Sized> JournalableEvent for Box<T> {
    fn journaled_schema_name(&self) -> String {
        (**self).journaled_schema_name()
    }

    fn journaled_partition_key(&self) -> String {
        (**self).journaled_partition_key()
    }

    fn journaled_attributes(&self) -> Attributes {
        (**self).journaled_attributes()
    }

    fn journaled_app_name(&self) -> Option<String> {
        (**self).journaled_app_name()
    }

    fn journaled_enqueue_opts(&self) -> EnqueueOptions {
        (**self).journaled_enqueue_opts()
    }
}

/// Scheduler options attached to a journal call.
///
/// Unset fields are filled from [`Config`] when the task is enqueued.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_at: Option<DateTime<Utc>>,
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }

    /// Fields set on `self` win over those on `other`.
    pub fn merge(&self, other: &EnqueueOptions) -> EnqueueOptions {
        EnqueueOptions {
            priority: self.priority.or(other.priority),
            queue: self.queue.clone().or_else(|| other.queue.clone()),
            run_at: self.run_at.or(other.run_at),
        }
    }

    /// Fills priority and queue from the process defaults.
    pub fn resolve(&self, config: &Config) -> EnqueueOptions {
        EnqueueOptions {
            priority: Some(self.priority.unwrap_or(config.job_priority)),
            queue: self.queue.clone().or_else(|| config.job_queue.clone()),
            run_at: self.run_at,
        }
    }
}

/// An owned event, as built by producers or converted from a [`RawEvent`].
#[derive(Debug, Clone, PartialEq)]
pub struct JournalEvent {
    pub schema_name: String,
    pub partition_key: String,
    pub attributes: Attributes,
    pub app_name: Option<String>,
    pub enqueue_opts: EnqueueOptions,
}

impl JournalEvent {
    pub fn new(
        schema_name: impl Into<String>,
        partition_key: impl Into<String>,
        attributes: Attributes,
    ) -> Self {
        Self {
            schema_name: schema_name.into(),
            partition_key: partition_key.into(),
            attributes,
            app_name: None,
            enqueue_opts: EnqueueOptions::default(),
        }
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn with_enqueue_opts(mut self, opts: EnqueueOptions) -> Self {
        self.enqueue_opts = opts;
        self
    }
}

impl JournalableEvent for JournalEvent {
    fn journaled_schema_name(&self) -> String {
        self.schema_name.clone()
    }

    fn journaled_partition_key(&self) -> String {
        self.partition_key.clone()
    }

    fn journaled_attributes(&self) -> Attributes {
        self.attributes.clone()
    }

    fn journaled_app_name(&self) -> Option<String> {
        self.app_name.clone()
    }

    fn journaled_enqueue_opts(&self) -> EnqueueOptions {
        self.enqueue_opts.clone()
    }
}

/// An event as received from a dynamic source, where any field may be absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub attributes: Option<Attributes>,
    #[serde(default)]
    pub app_name: Option<String>,
    #[serde(default)]
    pub enqueue_opts: Option<EnqueueOptions>,
}

const REQUIRED_FIELDS: &str = "schema_name, partition_key and attributes";

impl RawEvent {
    /// Converts into a [`JournalEvent`], deriving a missing partition key
    /// with `key_strategy` when one is given.
    pub fn into_event(self, key_strategy: Option<&KeyStrategy>) -> Result<JournalEvent> {
        let schema_name = self.schema_name.ok_or_else(missing_field)?;
        let attributes = self.attributes.ok_or_else(missing_field)?;

        let partition_key = match (self.partition_key, key_strategy) {
            (Some(key), _) => key,
            (None, Some(strategy)) => strategy
                .extract_key(&schema_name, &attributes)
                .ok_or_else(|| {
                    Error::ContractViolation(format!(
                        "could not derive a partition key with {:?}",
                        strategy
                    ))
                })?,
            (None, None) => return Err(missing_field()),
        };

        Ok(JournalEvent {
            schema_name,
            partition_key,
            attributes,
            app_name: self.app_name,
            enqueue_opts: self.enqueue_opts.unwrap_or_default(),
        })
    }
}

impl TryFrom<RawEvent> for JournalEvent {
    type Error = Error;

    fn try_from(raw: RawEvent) -> Result<Self> {
        raw.into_event(None)
    }
}

fn missing_field() -> Error {
    Error::ContractViolation(format!("An enqueued event must respond to: {}", REQUIRED_FIELDS))
}

/// Formats a timestamp the way journaled payloads carry it:
/// millisecond precision, UTC, `Z` suffix.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Serializes any value whose JSON form is an object into [`Attributes`].
pub fn to_attributes<T: Serialize>(value: &T) -> Result<Attributes> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::ContractViolation(format!(
            "journaled attributes must serialize to a JSON object, got {}",
            other
        ))),
    }
}

/// `#[serde(with = "journaled::event::timestamp")]` for `DateTime<Utc>` fields.
pub mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Serialize)]
    struct UserRenamed {
        id: Uuid,
        event_type: &'static str,
        #[serde(with = "timestamp")]
        created_at: DateTime<Utc>,
    }

    #[test]
    fn test_format_timestamp_millis() {
        let ts = Utc.with_ymd_and_hms(2020, 3, 18, 17, 55, 0).unwrap();
        assert_eq!(format_timestamp(&ts), "2020-03-18T17:55:00.000Z");
    }

    #[test]
    fn test_to_attributes_uuid_and_timestamp() {
        let id = Uuid::new_v4();
        let attrs = to_attributes(&UserRenamed {
            id,
            event_type: "user_renamed",
            created_at: Utc.with_ymd_and_hms(2020, 3, 18, 17, 55, 0).unwrap(),
        })
        .unwrap();

        assert_eq!(attrs["id"], json!(id.to_string()));
        assert_eq!(attrs["created_at"], json!("2020-03-18T17:55:00.000Z"));
    }

    #[test]
    fn test_to_attributes_rejects_non_object() {
        assert!(matches!(
            to_attributes(&vec![1, 2, 3]),
            Err(Error::ContractViolation(_))
        ));
    }

    #[test]
    fn test_enqueue_options_merge_and_resolve() {
        let caller = EnqueueOptions::default().with_priority(13);
        let event = EnqueueOptions::default().with_priority(1).with_queue("events");

        let merged = caller.merge(&event);
        assert_eq!(merged.priority, Some(13));
        assert_eq!(merged.queue.as_deref(), Some("events"));

        let config = Config {
            job_priority: 999,
            ..Config::default()
        };
        let resolved = EnqueueOptions::default().resolve(&config);
        assert_eq!(resolved.priority, Some(999));
        assert!(resolved.queue.is_none());
    }

    #[test]
    fn test_raw_event_missing_fields() {
        let raw = RawEvent {
            schema_name: Some("fake_schema_name".to_string()),
            ..RawEvent::default()
        };

        let err = JournalEvent::try_from(raw).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("An enqueued event must respond to"));
        assert!(msg.contains("partition_key"));
        assert!(!msg.contains("app_name"));
        assert!(!msg.contains("enqueue_opts"));
    }

    #[test]
    fn test_raw_event_without_app_name_or_options() {
        let raw: RawEvent = serde_json::from_value(json!({
            "schema_name": "fake_schema_name",
            "partition_key": "key",
            "attributes": {"foo": "bar"}
        }))
        .unwrap();

        let event = JournalEvent::try_from(raw).unwrap();
        assert!(event.app_name.is_none());
        assert_eq!(event.enqueue_opts, EnqueueOptions::default());
    }

    #[test]
    fn test_raw_event_derives_partition_key() {
        let raw: RawEvent = serde_json::from_value(json!({
            "schema_name": "fake_schema_name",
            "attributes": {"id": "abc", "foo": "bar"},
            "app_name": "my_app"
        }))
        .unwrap();

        let event = raw
            .into_event(Some(&KeyStrategy::Field("id".to_string())))
            .unwrap();
        assert_eq!(event.partition_key, "abc");
        assert_eq!(event.app_name.as_deref(), Some("my_app"));
    }
}
