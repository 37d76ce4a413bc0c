pub mod endpoint;

pub use endpoint::KafkaStreamEndpoint;
