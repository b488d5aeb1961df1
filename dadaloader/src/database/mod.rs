//! SQLite persistence for download records.
//!
//! A record write is only reported as successful once SQLite has committed
//! it to disk, so the pool runs in WAL mode with `synchronous = FULL`.

pub mod models;
pub mod repositories;
pub mod retry;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use tracing::{info, warn};

pub type DbPool = Pool<Sqlite>;

/// Tuning knobs for the download store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Few writers touch the store: the manager and one handler per run.
    pub max_connections: u32,
    /// How long a statement waits on a locked database before failing.
    pub busy_timeout: Duration,
    pub acquire_timeout: Duration,
    /// WAL pages before an automatic checkpoint.
    pub wal_autocheckpoint: u32,
    pub journal_size_limit: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            max_connections: 4,
            busy_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
            wal_autocheckpoint: 1000,
            journal_size_limit: 16 * 1024 * 1024,
        }
    }
}

impl StoreOptions {
    fn connect_options(&self, database_url: &str) -> Result<SqliteConnectOptions, sqlx::Error> {
        Ok(SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(self.busy_timeout)
            .pragma("wal_autocheckpoint", self.wal_autocheckpoint.to_string())
            .pragma("journal_size_limit", self.journal_size_limit.to_string())
            .pragma("temp_store", "MEMORY"))
    }
}

/// Open the store at `database_url` with default options.
pub async fn init_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    open_store(database_url, &StoreOptions::default()).await
}

pub async fn open_store(database_url: &str, options: &StoreOptions) -> Result<DbPool, sqlx::Error> {
    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .acquire_timeout(options.acquire_timeout)
        .connect_with(options.connect_options(database_url)?)
        .await?;

    // In-memory databases cannot use WAL; anything else should.
    let (journal_mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await?;
    if !journal_mode.eq_ignore_ascii_case("wal") {
        warn!(journal_mode = %journal_mode, "Download store is not in WAL mode");
    }

    info!(
        max_connections = options.max_connections,
        "Opened download store {}", database_url
    );
    Ok(pool)
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("Download store schema is up to date");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_is_durable_wal() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("test.db").display());
        let pool = init_pool(&url).await.unwrap();

        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(mode, "wal");

        // FULL is 2.
        let (synchronous,): (i64,) = sqlx::query_as("PRAGMA synchronous")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(synchronous, 2);

        run_migrations(&pool).await.unwrap();
        let (tables,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'downloads'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(tables, 1);
    }
}
