//! Embedded persistence layer for RapidFlow.
//!
//! A thin store over SQLite via sqlx. The store is the single source of
//! truth for pipeline/job/step/runnable/deployment status; writes are scoped
//! to single rows and are not transactionally composed across tables, so the
//! denormalized job graph is eventually consistent within a job.

pub mod error;
pub mod records;
pub mod store;

pub use error::{DbError, DbResult};
pub use records::*;
pub use store::Store;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;

/// Create a connection pool for the given SQLite URL (e.g.
/// `sqlite://rapidflow.db` or `sqlite::memory:`). The database file is
/// created when missing.
pub async fn create_pool(database_url: &str) -> DbResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// An in-memory store for tests and the synchronous CLI path. A single
/// connection keeps the memory database alive for the pool's lifetime.
pub async fn open_in_memory() -> DbResult<Store> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    run_migrations(&pool).await?;
    Ok(Store::new(pool))
}
