use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::event::Attributes;

/// How a partition key is derived for events that do not carry one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// All events of one schema share a partition.
    SchemaName,
    /// A single attribute, addressed by a dotted path (`user.profile.id`).
    Field(String),
    /// Several attributes joined with `:`.
    Composite(Vec<String>),
    /// A fresh UUID per event; spreads load, gives up per-key ordering.
    Random,
}

impl KeyStrategy {
    pub fn extract_key(&self, schema_name: &str, attributes: &Attributes) -> Option<String> {
        match self {
            KeyStrategy::SchemaName => {
                if schema_name.is_empty() {
                    None
                } else {
                    Some(schema_name.to_string())
                }
            }
            KeyStrategy::Field(path) => extract_field_value(attributes, path),
            KeyStrategy::Composite(fields) => extract_composite_key(attributes, fields),
            KeyStrategy::Random => Some(Uuid::new_v4().to_string()),
        }
    }

    /// Parses the CLI form: `schema`, `random`, `field:<path>` or
    /// `composite:<a>,<b>`.
    pub fn parse(spec: &str) -> Option<Self> {
        match spec.split_once(':') {
            None if spec == "schema" => Some(KeyStrategy::SchemaName),
            None if spec == "random" => Some(KeyStrategy::Random),
            Some(("field", path)) if !path.is_empty() => Some(KeyStrategy::Field(path.to_string())),
            Some(("composite", fields)) => {
                let fields: Vec<String> = fields
                    .split(',')
                    .map(str::trim)
                    .filter(|f| !f.is_empty())
                    .map(str::to_string)
                    .collect();
                if fields.is_empty() {
                    None
                } else {
                    Some(KeyStrategy::Composite(fields))
                }
            }
            _ => None,
        }
    }
}

fn extract_field_value(attributes: &Attributes, field_path: &str) -> Option<String> {
    let mut parts = field_path.split('.');
    let first = parts.next()?;
    let mut current = match attributes.get(first) {
        Some(value) => value,
        None => {
            debug!("Field '{}' not found in attributes", first);
            return None;
        }
    };

    for part in parts {
        match current.get(part) {
            Some(value) => current = value,
            None => {
                debug!("Field '{}' not found in attributes", part);
                return None;
            }
        }
    }

    match current {
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        _ => Some(current.to_string()),
    }
}

fn extract_composite_key(attributes: &Attributes, fields: &[String]) -> Option<String> {
    let mut key_parts = Vec::with_capacity(fields.len());

    for field in fields {
        if let Some(value) = extract_field_value(attributes, field) {
            key_parts.push(value);
        } else {
            debug!("Missing field '{}' for composite key", field);
            return None;
        }
    }

    if key_parts.is_empty() {
        None
    } else {
        Some(key_parts.join(":"))
    }
}
