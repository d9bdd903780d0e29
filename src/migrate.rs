use anyhow::Result;
use sqlx::SqlitePool;

/// Create the embedding and dedup tables if absent. Idempotent.
///
/// `table` is the embedding table name from config (validated to be a bare
/// identifier at config load).
pub async fn run_migrations(pool: &SqlitePool, table: &str) -> Result<()> {
    sqlx::query(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            text TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{{}}',
            embedding BLOB NOT NULL
        )
        "#
    ))
    .execute(pool)
    .await?;

    // Maps stored embedding rows back to the identifier that produced them.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS identifier_to_rowid (
            embedding_row_id INTEGER NOT NULL,
            identifier_hash TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_identifier_hash ON identifier_to_rowid(identifier_hash)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
