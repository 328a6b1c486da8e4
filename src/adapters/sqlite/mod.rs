//! SQLite store adapters.

pub mod connection;
pub mod connector_repository;
pub mod execution_repository;
pub mod migrations;
pub mod workflow_repository;

pub use connection::{create_pool, create_test_pool, ConnectionError, PoolConfig};
pub use connector_repository::SqliteConnectorStore;
pub use execution_repository::SqliteExecutionStore;
pub use migrations::{Migration, MigrationError, Migrator};
pub use workflow_repository::SqliteWorkflowStore;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{DomainError, DomainResult};

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Open the pool and bring the schema up to date.
pub async fn initialize_database(database_url: &str) -> Result<SqlitePool, DatabaseError> {
    let pool = create_pool(database_url, None).await?;
    Migrator::new(pool.clone()).run().await?;
    Ok(pool)
}

/// In-memory pool with all migrations applied, for tests.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, DatabaseError> {
    let pool = create_test_pool().await?;
    Migrator::new(pool.clone()).run().await?;
    Ok(pool)
}

pub(crate) fn parse_uuid(s: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| DomainError::Serialization(e.to_string()))
}

pub(crate) fn parse_datetime(s: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DomainError::Serialization(e.to_string()))
}

pub(crate) fn parse_optional_datetime(s: Option<String>) -> DomainResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime).transpose()
}
