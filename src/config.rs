use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Values of the enable gate that switch delivery off.
const FALSEY_GATE_VALUES: &[&str] = &["0", "false", "f", ""];

/// Upper bound for the stagger between consecutive batches (one day).
const MAX_PER_BATCH_DELAY_MS: u64 = 86_400_000;

/// Process-wide journaling settings, built once at startup and passed
/// explicitly to the writer, the delivery agent and the worker.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Deployment environment; `development` and `test` disable delivery
    /// unless the gate is set explicitly.
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Raw enable gate value (`JOURNALED_ENABLED`).
    #[serde(default)]
    pub enabled: Option<String>,
    #[serde(default = "default_chunk_limit")]
    pub bulk_delivery_chunk_limit: usize,
    #[serde(default = "default_job_priority")]
    pub job_priority: i32,
    #[serde(default)]
    pub job_queue: Option<String>,
    /// Stagger between consecutive chunks of one bulk journal call.
    #[serde(default)]
    pub per_batch_delay_ms: Option<u64>,
    /// How many times a partially failing batch may be split and requeued.
    #[serde(default = "default_max_requeue_depth")]
    pub max_requeue_depth: u32,
    #[serde(default)]
    pub default_app_name: Option<String>,
    #[serde(default)]
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    #[serde(default = "default_brokers")]
    pub brokers: Vec<String>,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    #[serde(default = "default_pg_host")]
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    #[serde(default = "default_pg_database")]
    pub database: String,
    #[serde(default = "default_pg_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_table")]
    pub table: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i32,
    #[serde(default = "default_worker_name")]
    pub worker_name: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(config::File::from(path.as_ref()));
        Self::build(builder)
    }

    /// Builds the configuration from `JOURNALED_*` environment variables only.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::build(config::Config::builder())
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, config::ConfigError> {
        let settings = builder
            .add_source(
                config::Environment::with_prefix("JOURNALED")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), config::ConfigError> {
        if self.bulk_delivery_chunk_limit == 0 {
            return Err(config::ConfigError::Message(
                "bulk_delivery_chunk_limit must be at least 1".to_string(),
            ));
        }
        if matches!(self.per_batch_delay_ms, Some(ms) if ms > MAX_PER_BATCH_DELAY_MS) {
            return Err(config::ConfigError::Message(format!(
                "per_batch_delay_ms must be at most {}",
                MAX_PER_BATCH_DELAY_MS
            )));
        }
        Ok(())
    }

    /// Whether batches are actually sent to the stream.
    pub fn delivery_enabled(&self) -> bool {
        gate_enabled(self.enabled.as_deref(), &self.environment)
    }

    pub fn development_or_test(&self) -> bool {
        matches!(self.environment.as_str(), "development" | "test")
    }

    pub fn per_batch_delay(&self) -> Option<chrono::Duration> {
        self.per_batch_delay_ms
            .filter(|ms| *ms > 0)
            .and_then(|ms| i64::try_from(ms).ok())
            .and_then(chrono::Duration::try_milliseconds)
    }
}

impl QueueConfig {
    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?connect_timeout={}",
            self.username,
            self.password,
            self.host,
            self.port,
            self.database,
            self.connect_timeout_secs
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Interprets a raw enable gate value.
///
/// An explicit value wins; without one, delivery is on everywhere except
/// development and test.
pub fn gate_enabled(raw: Option<&str>, environment: &str) -> bool {
    match raw {
        Some(value) => {
            let value = value.trim().to_ascii_lowercase();
            !FALSEY_GATE_VALUES.contains(&value.as_str())
        }
        None => !matches!(environment, "development" | "test"),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            enabled: None,
            bulk_delivery_chunk_limit: default_chunk_limit(),
            job_priority: default_job_priority(),
            job_queue: None,
            per_batch_delay_ms: None,
            max_requeue_depth: default_max_requeue_depth(),
            default_app_name: None,
            kafka: KafkaConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            compression: default_compression(),
            acks: default_acks(),
            linger_ms: default_linger_ms(),
            message_timeout_ms: default_message_timeout_ms(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            host: default_pg_host(),
            port: default_pg_port(),
            database: default_pg_database(),
            username: default_pg_username(),
            password: String::new(),
            table: default_table(),
            connect_timeout_secs: default_connect_timeout(),
            poll_interval_ms: default_poll_interval_ms(),
            max_attempts: default_max_attempts(),
            worker_name: default_worker_name(),
        }
    }
}

fn default_environment() -> String {
    "production".to_string()
}

fn default_chunk_limit() -> usize {
    500
}

fn default_job_priority() -> i32 {
    20
}

fn default_max_requeue_depth() -> u32 {
    10
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_linger_ms() -> u32 {
    5
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_pg_host() -> String {
    "localhost".to_string()
}

fn default_pg_port() -> u16 {
    5432
}

fn default_pg_database() -> String {
    "postgres".to_string()
}

fn default_pg_username() -> String {
    "postgres".to_string()
}

fn default_table() -> String {
    "journaled_delivery_jobs".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_attempts() -> i32 {
    25
}

fn default_worker_name() -> String {
    format!("journaled-worker-{}", std::process::id())
}
