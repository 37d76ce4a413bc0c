#![allow(dead_code)]

use journaled::config::{Config, QueueConfig};
use journaled::event::{to_attributes, Attributes, JournalEvent};
use journaled::SchemaRegistry;
use serde_json::json;
use std::env;

/// Config with delivery switched on and the queue pointed at `TEST_PG_*`.
pub fn get_test_config() -> Config {
    let queue = QueueConfig {
        host: env::var("TEST_PG_HOST").unwrap_or_else(|_| "localhost".to_string()),
        port: env::var("TEST_PG_PORT")
            .unwrap_or_else(|_| "5432".to_string())
            .parse()
            .unwrap_or(5432),
        database: env::var("TEST_PG_DATABASE").unwrap_or_else(|_| "postgres".to_string()),
        username: env::var("TEST_PG_USERNAME").unwrap_or_else(|_| "postgres".to_string()),
        password: env::var("TEST_PG_PASSWORD").unwrap_or_else(|_| "postgres".to_string()),
        table: format!("test_jobs_{}", std::process::id()),
        poll_interval_ms: 50,
        max_attempts: 3,
        ..QueueConfig::default()
    };

    Config {
        environment: "test".to_string(),
        enabled: Some("true".to_string()),
        queue,
        ..Config::default()
    }
}

pub fn widget_registry() -> SchemaRegistry {
    let mut registry = SchemaRegistry::new();
    registry
        .register(
            "widget_created",
            &json!({
                "type": "object",
                "properties": {
                    "widget_id": { "type": "string" },
                    "color": { "type": "string", "enum": ["red", "green", "blue"] }
                },
                "required": ["widget_id", "color"]
            }),
        )
        .unwrap();
    registry
}

pub fn widget_attributes(widget_id: &str, color: &str) -> Attributes {
    to_attributes(&json!({
        "id": format!("evt-{}", widget_id),
        "event_type": "widget_created",
        "created_at": "2020-03-18T17:55:00.000Z",
        "widget_id": widget_id,
        "color": color
    }))
    .unwrap()
}

pub fn widget_event(widget_id: &str) -> JournalEvent {
    JournalEvent::new("widget_created", widget_id, widget_attributes(widget_id, "red"))
}
