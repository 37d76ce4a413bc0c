use tokio::task::JoinHandle;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{error, info};

use crate::Result;

/// An open client plus the task driving its connection.
pub struct PgConnection {
    pub client: Client,
    connection_task: JoinHandle<()>,
}

impl PgConnection {
    pub async fn connect(connection_string: &str) -> Result<Self> {
        info!("Connecting to PostgreSQL job queue");

        let config = connection_string.parse::<Config>()?;
        let (client, connection) = config.connect(NoTls).await?;

        let connection_task = tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("Connection error: {}", e);
            }
        });

        info!("Successfully connected to PostgreSQL");
        Ok(Self {
            client,
            connection_task,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.client.is_closed() || self.connection_task.is_finished()
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}
