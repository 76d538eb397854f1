//! # tally-db
//!
//! Storage backends for the tally invoice pipeline.
//!
//! This crate provides:
//! - Connection pool management for PostgreSQL and SQLite
//! - Idempotent schema bootstrap for the relational backends
//! - [`InvoiceStore`] implementations: PostgreSQL, SQLite, and a JSON document store
//! - Backend selection from configuration
//!
//! ## Example
//!
//! ```rust,ignore
//! use tally_db::{connect, StorageConfig};
//!
//! let store = connect(&StorageConfig::from_env()?).await?;
//! store.health_check().await?;
//! ```

pub mod config;
pub mod document;
pub mod pool;
pub mod postgres;
pub mod schema;
pub mod sqlite;

mod common;

use std::sync::Arc;

use tracing::info;

pub use config::{StorageBackend, StorageConfig};
pub use document::DocumentInvoiceStore;
pub use pool::{create_pg_pool, create_sqlite_pool, PoolConfig};
pub use postgres::PgInvoiceStore;
pub use sqlite::SqliteInvoiceStore;

// Re-export core types
pub use tally_core::{InvoiceStore, Result};

/// Open the configured backend, creating its schema if needed.
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn InvoiceStore>> {
    info!(
        subsystem = "database",
        component = "connect",
        op = "open",
        backend = %config.backend.kind(),
        location = %config.backend.redacted_location(),
        "Opening invoice store"
    );

    let store: Arc<dyn InvoiceStore> = match &config.backend {
        StorageBackend::Postgres { url } => {
            let pool = create_pg_pool(url, &config.pool).await?;
            schema::ensure_pg_schema(&pool).await?;
            Arc::new(PgInvoiceStore::new(pool))
        }
        StorageBackend::Sqlite { path } => {
            let pool = create_sqlite_pool(path, &config.pool).await?;
            schema::ensure_sqlite_schema(&pool).await?;
            Arc::new(SqliteInvoiceStore::new(pool))
        }
        StorageBackend::Document { dir } => {
            Arc::new(DocumentInvoiceStore::open(dir, &config.pool).await?)
        }
    };
    Ok(store)
}
