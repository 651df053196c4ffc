//! SQLite connection pool.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::DbError;

/// Type alias for the shared SQLite pool used across the whole application.
pub type DbPool = SqlitePool;

/// Create a new connection pool from the given `database_url`.
///
/// The database file is created when missing. In-memory databases live only
/// as long as their connection, so they are pinned to a single connection
/// that is never recycled.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<DbPool, DbError> {
    info!("Connecting to database (max_connections={})", max_connections);

    let connect_options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let in_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections)
    };

    let pool = pool_options.connect_with(connect_options).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations located in `./migrations` (relative to the
/// workspace root at build time).
pub async fn run_migrations(pool: &DbPool) -> Result<(), DbError> {
    info!("Running database migrations");
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

/// Fresh, migrated in-memory database. Intended for tests.
pub async fn in_memory() -> Result<DbPool, DbError> {
    let pool = create_pool("sqlite::memory:", 1).await?;
    run_migrations(&pool).await?;
    Ok(pool)
}
