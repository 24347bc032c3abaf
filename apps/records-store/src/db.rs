use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

const RECORDS_SCHEMA_SQL: &str = include_str!("../migrations/0001_records_state.sql");

/// Two connections to the records database. Writes hold `writer` for their
/// whole transaction; snapshot reads go through `reader` so they never queue
/// behind a write in flight.
#[derive(Clone)]
pub struct RecordsDb {
    writer: Arc<Mutex<Client>>,
    reader: Arc<Mutex<Client>>,
}

impl RecordsDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let writer = open_connection(database_url, "writer").await?;
        let reader = open_connection(database_url, "reader").await?;
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    pub fn writer(&self) -> Arc<Mutex<Client>> {
        self.writer.clone()
    }

    pub fn reader(&self) -> Arc<Mutex<Client>> {
        self.reader.clone()
    }

    /// Creates the `records` schema, state table and mirror table. Safe to
    /// run repeatedly.
    pub async fn apply_schema(&self) -> Result<()> {
        let writer = self.writer.lock().await;
        writer
            .batch_execute(RECORDS_SCHEMA_SQL)
            .await
            .context("apply records schema")?;
        tracing::info!("records schema applied");
        Ok(())
    }
}

async fn open_connection(database_url: &str, role: &'static str) -> Result<Client> {
    let (client, connection) = tokio_postgres::connect(database_url, NoTls)
        .await
        .with_context(|| format!("open records {role} connection"))?;

    tokio::spawn(async move {
        if let Err(error) = connection.await {
            tracing::error!(role, reason = %error, "records postgres connection closed");
        }
    });

    Ok(client)
}
