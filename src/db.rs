use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};

use crate::config::Config;

/// Below this, sqlite surfaces "database is locked" and the pipeline's
/// busy-retry loop takes over.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating if missing) the sqlite database from the config.
///
/// WAL keeps readers unblocked while the pipeline writes; the pool stays
/// small because the single pipeline consumer owns all writes and only
/// similarity searches read concurrently.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}
