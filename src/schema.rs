//! JSON Schema validation of event attributes.
//!
//! Every event is checked twice before anything is serialized: first against
//! the generic [`BASE_EVENT_SCHEMA`] envelope, then against the schema
//! registered under its own schema name. The first failure wins.

use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::debug;

use crate::event::{Attributes, EnqueueOptions, JournalableEvent};
use crate::{Error, Result};

/// Name of the envelope schema applied to every event.
pub const BASE_EVENT_SCHEMA: &str = "base_event";

/// An event whose attributes passed both schema checks.
///
/// Fields are private so a value of this type always satisfies the
/// non-empty invariants checked in [`SchemaRegistry::validate`].
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedEvent {
    schema_name: String,
    partition_key: String,
    document: Value,
    app_name: Option<String>,
    enqueue_opts: EnqueueOptions,
}

impl ValidatedEvent {
    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// The validated attributes as a JSON document.
    pub fn document(&self) -> &Value {
        &self.document
    }

    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    pub fn enqueue_opts(&self) -> &EnqueueOptions {
        &self.enqueue_opts
    }
}

/// Compiled schemas keyed by name.
pub struct SchemaRegistry {
    validators: HashMap<String, jsonschema::Validator>,
}

impl SchemaRegistry {
    /// A registry holding only the envelope schema.
    pub fn new() -> Self {
        let mut registry = Self {
            validators: HashMap::new(),
        };
        registry
            .validators
            .insert(BASE_EVENT_SCHEMA.to_string(), compile_base_event());
        registry
    }

    /// Registers (or replaces) a schema.
    pub fn register(&mut self, name: impl Into<String>, schema: &Value) -> Result<()> {
        let name = name.into();
        let validator = compile(schema)
            .map_err(|e| Error::Config(format!("Failed to compile JSON schema '{}': {}", name, e)))?;

        debug!("Registered schema '{}'", name);
        self.validators.insert(name, validator);
        Ok(())
    }

    pub fn register_str(&mut self, name: impl Into<String>, schema: &str) -> Result<()> {
        let schema: Value = serde_json::from_str(schema)?;
        self.register(name, &schema)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.validators.contains_key(name)
    }

    /// Checks `document` against one named schema.
    pub fn validate_document(&self, name: &str, document: &Value) -> Result<()> {
        let validator = self
            .validators
            .get(name)
            .ok_or_else(|| Error::UnknownSchema(name.to_string()))?;

        let errors: Vec<String> = validator.iter_errors(document).map(|e| e.to_string()).collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::SchemaValidation {
                schema: name.to_string(),
                detail: errors.join("; "),
            })
        }
    }

    /// Runs the completeness check, then the envelope and event schemas.
    pub fn validate<E: JournalableEvent + ?Sized>(&self, event: &E) -> Result<ValidatedEvent> {
        let schema_name = event.journaled_schema_name();
        let partition_key = event.journaled_partition_key();
        let attributes = event.journaled_attributes();
        let app_name = event.journaled_app_name();

        check_present(&schema_name, &partition_key, &attributes, app_name.as_deref())?;

        let document = Value::Object(attributes);
        self.validate_document(BASE_EVENT_SCHEMA, &document)?;
        self.validate_document(&schema_name, &document)?;

        Ok(ValidatedEvent {
            schema_name,
            partition_key,
            document,
            app_name,
            enqueue_opts: event.journaled_enqueue_opts(),
        })
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn check_present(
    schema_name: &str,
    partition_key: &str,
    attributes: &Attributes,
    app_name: Option<&str>,
) -> Result<()> {
    if schema_name.trim().is_empty() || partition_key.trim().is_empty() || attributes.is_empty() {
        return Err(Error::ContractViolation(
            "An enqueued event must have a non-empty response to: \
             journaled_schema_name, journaled_partition_key and journaled_attributes"
                .to_string(),
        ));
    }

    if matches!(app_name, Some(name) if name.trim().is_empty()) {
        return Err(Error::ContractViolation(
            "journaled_app_name must be absent or non-empty".to_string(),
        ));
    }

    Ok(())
}

fn base_event_schema() -> Value {
    json!({
        "title": "base_event",
        "type": "object",
        "properties": {
            "id": { "type": "string" },
            "event_type": { "type": "string" },
            "created_at": { "type": "string", "format": "date-time" }
        },
        "required": ["id", "event_type", "created_at"]
    })
}

/// Compiles with `format` asserted, so `date-time` and friends are checked
/// rather than treated as annotations.
fn compile(schema: &Value) -> std::result::Result<jsonschema::Validator, jsonschema::ValidationError<'static>> {
    jsonschema::options()
        .should_validate_formats(true)
        .build(schema)
}

fn compile_base_event() -> jsonschema::Validator {
    match compile(&base_event_schema()) {
        Ok(validator) => validator,
        Err(e) => unreachable!("built-in base_event schema must compile: {}", e),
    }
}
