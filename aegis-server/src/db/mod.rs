//! Database module for Aegis Server
//!
//! Connection pooling and the PostgreSQL credential repository.

mod credentials;

pub use credentials::PostgresCredentialRepository;

use std::time::Duration;

use aegis_core::StorageError;
use sqlx::postgres::PgPoolOptions;

use crate::config::Config;

/// Connect to PostgreSQL and apply migrations.
pub async fn connect(
    database_url: &str,
    config: &Config,
) -> Result<PostgresCredentialRepository, StorageError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .min_connections(config.database_min_connections)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
        .map_err(|e| StorageError::Connection(e.to_string()))?;

    tracing::info!(
        max_connections = config.database_max_connections,
        "Connected to PostgreSQL database"
    );

    let repository = PostgresCredentialRepository::from_pool(pool);
    repository.migrate().await?;
    Ok(repository)
}
