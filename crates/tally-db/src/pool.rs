//! Connection pools for the SQL backends.
//!
//! The document store has no connections; it reuses [`PoolConfig::max_connections`]
//! as its session cap.

use std::str::FromStr;
use std::time::{Duration, Instant};

use sqlx::pool::PoolOptions;
use sqlx::postgres::PgPool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool};
use sqlx::Database;
use tracing::{debug, info, warn};

use tally_core::{defaults, Error, Result};

/// Default pool acquire timeout in seconds (`STORAGE_CONNECT_TIMEOUT_SECS`).
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 30;

const IDLE_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_LIFETIME: Duration = Duration::from_secs(1800);

/// How long SQLite waits on a locked database before failing.
pub const SQLITE_BUSY_TIMEOUT_SECS: u64 = 5;

/// Storage pool sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Connections for SQL backends, concurrent sessions for the document store.
    pub max_connections: u32,
    /// How long a storage call waits for a free connection.
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: defaults::STORAGE_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    fn options<DB: Database>(&self) -> PoolOptions<DB> {
        PoolOptions::<DB>::new()
            .max_connections(self.max_connections)
            .min_connections(1)
            .acquire_timeout(self.acquire_timeout)
            .idle_timeout(IDLE_TIMEOUT)
            .max_lifetime(MAX_LIFETIME)
    }
}

/// Create a PostgreSQL connection pool.
pub async fn create_pg_pool(database_url: &str, config: &PoolConfig) -> Result<PgPool> {
    let start = Instant::now();
    info!(
        subsystem = "database",
        component = "pool",
        op = "create",
        backend = "postgresql",
        max_connections = config.max_connections,
        acquire_timeout_secs = config.acquire_timeout.as_secs(),
        "Opening invoice store pool"
    );

    let pool = config
        .options()
        .connect(database_url)
        .await
        .map_err(Error::Database)?;

    established("postgresql", pool.size(), start);
    Ok(pool)
}

/// Create a SQLite connection pool.
///
/// `path` is a file path, a `sqlite:` URL, or `:memory:`. An in-memory
/// database lives in a single connection that is never recycled, since every
/// new connection would open an empty database.
pub async fn create_sqlite_pool(path: &str, config: &PoolConfig) -> Result<SqlitePool> {
    let start = Instant::now();
    let in_memory = is_memory_path(path);

    let base = if in_memory {
        SqliteConnectOptions::from_str("sqlite::memory:").map_err(Error::Database)?
    } else if path.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(path).map_err(Error::Database)?
    } else {
        SqliteConnectOptions::new().filename(path)
    };
    let mut connect_options = base
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(SQLITE_BUSY_TIMEOUT_SECS));
    if !in_memory {
        connect_options = connect_options.journal_mode(SqliteJournalMode::Wal);
    }

    let options = if in_memory {
        config
            .options()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        config.options()
    };

    info!(
        subsystem = "database",
        component = "pool",
        op = "create",
        backend = "sqlite",
        in_memory,
        max_connections = if in_memory { 1 } else { config.max_connections },
        "Opening invoice store pool"
    );

    let pool = options
        .connect_with(connect_options)
        .await
        .map_err(Error::Database)?;

    established("sqlite", pool.size(), start);
    Ok(pool)
}

fn established(backend: &str, size: u32, start: Instant) {
    info!(
        subsystem = "database",
        component = "pool",
        op = "established",
        backend,
        pool_size = size,
        duration_ms = start.elapsed().as_millis() as u64,
        "Invoice store pool ready"
    );
}

fn is_memory_path(path: &str) -> bool {
    matches!(path.trim(), ":memory:" | "sqlite::memory:" | "sqlite://:memory:")
}

/// Log pool usage; warns when every connection is checked out.
pub fn log_pool_metrics(backend: &str, size: u32, idle: usize) {
    debug!(
        subsystem = "database",
        component = "pool",
        op = "metrics",
        backend,
        pool_size = size,
        pool_idle = idle,
        "Pool usage"
    );

    if idle == 0 && size > 0 {
        warn!(
            subsystem = "database",
            component = "pool",
            backend,
            pool_size = size,
            "No idle storage connections; attachment pipelines will queue"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.acquire_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::default()
            .with_max_connections(20)
            .with_acquire_timeout(Duration::from_secs(60));

        assert_eq!(config.max_connections, 20);
        assert_eq!(config.acquire_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_memory_path_detection() {
        assert!(is_memory_path(":memory:"));
        assert!(is_memory_path("sqlite::memory:"));
        assert!(!is_memory_path("invoice_processing.db"));
    }

    #[tokio::test]
    async fn test_in_memory_pool_keeps_one_connection() {
        let pool = create_sqlite_pool(":memory:", &PoolConfig::default())
            .await
            .unwrap();
        sqlx::query("CREATE TABLE t (x INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        // Same connection, so the table is still there.
        sqlx::query("INSERT INTO t (x) VALUES (1)")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(pool.size(), 1);
    }
}
