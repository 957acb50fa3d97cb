use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};

pub mod row_parsers;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings shared by every pool: WAL so readers never block the
/// writer, and a busy timeout so writers queue instead of failing.
pub fn tune(options: SqliteConnectOptions) -> SqliteConnectOptions {
    options
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT)
}

/// Begins a transaction whose first statement is a write, so it waits for
/// the write lock up front. A deferred transaction that reads first cannot
/// upgrade while another writer commits and fails with SQLITE_BUSY.
pub async fn begin_write(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    sqlx::query("UPDATE write_lock SET acquired_at = ? WHERE id = 1")
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
    Ok(tx)
}

/// Explicitly constructed data-access handle. Services receive a clone at
/// construction time; the process closes it on shutdown.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = tune(SqliteConnectOptions::from_str(database_url).context("invalid DATABASE_URL")?);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .context("failed to connect to database")?;

        Ok(Self { pool })
    }

    pub async fn connect_from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        Self::connect(&database_url).await
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!()
            .run(&self.pool)
            .await
            .context("failed to run migrations")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        begin_write(&self.pool).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
