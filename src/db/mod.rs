use crate::config::{DatabaseConfig, StorageBackend};
use crate::error::Error;
use anyhow::Result;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub mod migrations;
pub mod models;
pub mod repositories;

use repositories::{MemoryViolationStore, ViolationStore, ViolationsRepository};

/// Database service for handling connections and migrations
pub struct DatabaseService {
    pub store: Arc<dyn ViolationStore>,
    pool: Option<Arc<PgPool>>,
}

impl DatabaseService {
    /// Create a new database service for the configured backend
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        match config.backend {
            StorageBackend::Memory => {
                warn!("Using in-memory violation store; records are lost on restart");
                Ok(Self {
                    store: Arc::new(MemoryViolationStore::new()),
                    pool: None,
                })
            }
            StorageBackend::Postgres => {
                info!("Initializing Database service");

                let pool = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(&config.url)
                    .await
                    .map_err(|e| Error::Database(format!("Failed to connect to database: {}", e)))?;

                info!("Connected to PostgreSQL database");

                let pool = Arc::new(pool);
                let service = Self {
                    store: Arc::new(ViolationsRepository::new(pool.clone())),
                    pool: Some(pool),
                };

                if config.auto_migrate {
                    service.run_migrations().await?;
                }

                Ok(service)
            }
        }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        let pool = match &self.pool {
            Some(pool) => pool,
            None => return Ok(()),
        };

        info!("Running database migrations");
        migrations::run_migrations(pool).await?;
        info!("Database migrations completed successfully");

        Ok(())
    }

    /// Health check for database
    pub async fn health_check(&self) -> Result<bool> {
        self.store.health_check().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_needs_no_connection() -> Result<()> {
        let config = DatabaseConfig {
            backend: StorageBackend::Memory,
            ..DatabaseConfig::default()
        };

        let service = DatabaseService::new(&config).await?;
        service.run_migrations().await?;
        assert!(service.health_check().await?);
        Ok(())
    }
}
