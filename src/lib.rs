pub mod config;
pub mod delivery;
pub mod error;
pub mod event;
pub mod key_strategy;
pub mod schema;
pub mod scheduler;
pub mod serializer;
pub mod stream;
pub mod testing;
pub mod worker;
pub mod writer;

pub mod kafka;
pub mod postgres;

pub use config::Config;
pub use delivery::{DeliveryAgent, DeliveryReport};
pub use error::{DeliveryError, Error, Result};
pub use event::{EnqueueOptions, JournalEvent, JournalableEvent, RawEvent};
pub use key_strategy::KeyStrategy;
pub use scheduler::{DeliveryTask, JobScheduler};
pub use schema::SchemaRegistry;
pub use serializer::{SerializedRecord, Serializer};
pub use stream::{StreamEndpoint, StreamNameResolver};
pub use worker::DeliveryWorker;
pub use writer::{BulkWriter, Writer};
