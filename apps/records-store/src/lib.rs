#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::{
    config::Config,
    db::RecordsDb,
    records::{RecordsService, store},
};

pub mod config;
pub mod db;
pub mod records;
pub mod telemetry;

/// Wires the store backend selected by `config.db_url` into a service. With no
/// database configured the in-memory backend is used.
pub async fn build_records_service(config: &Config) -> Result<RecordsService> {
    let store = match config.db_url.as_deref() {
        Some(url) => {
            let db = Arc::new(RecordsDb::connect(url).await?);
            store::postgres(db, config.state_id.clone())
        }
        None => store::memory(config.state_id.clone()),
    };
    info!(
        service = %config.service_name,
        state_id = %config.state_id,
        phase = %config.migration_phase,
        backend = if config.db_url.is_some() { "postgres" } else { "memory" },
        "records service configured"
    );
    Ok(RecordsService::from_config(store, config))
}
