pub mod connection;
pub mod job_queue;

pub use connection::PgConnection;
pub use job_queue::{ClaimedJob, PgJobQueue};
