//! Sqlite-backed vector store.
//!
//! Mirrors the interface the retrieval layer consumes: `add_texts`,
//! `similarity_search`, plus the delete/read-back operations the dedup
//! pipeline needs. Every method takes an explicit connection so callers can
//! scope several operations inside one transaction.

use async_trait::async_trait;
use sqlx::{Row, SqliteConnection};
use std::sync::Arc;
use thiserror::Error;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob, EmbeddingProvider};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("embedding failed: {0}")]
    Embedding(#[source] anyhow::Error),
}

impl StoreError {
    /// Sqlite-level contention ("database is locked"/"busy"); retried
    /// indefinitely by the pipeline instead of counting against the
    /// per-message retry budget.
    pub fn is_busy(&self) -> bool {
        match self {
            StoreError::Db(sqlx::Error::Database(db)) => {
                let message = db.message().to_lowercase();
                message.contains("locked") || message.contains("busy")
            }
            _ => false,
        }
    }
}

/// A similarity-search hit.
#[derive(Debug, Clone)]
pub struct ScoredText {
    pub row_id: i64,
    pub text: String,
    pub metadata: serde_json::Value,
    pub score: f64,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Embed and insert texts; returns the new row ids in input order.
    async fn add_texts(
        &self,
        conn: &mut SqliteConnection,
        texts: &[String],
        metadatas: &[serde_json::Value],
    ) -> Result<Vec<i64>, StoreError>;

    /// Stored texts for the given row ids, in rowid order. Missing rows are
    /// silently absent.
    async fn texts_by_row_ids(
        &self,
        conn: &mut SqliteConnection,
        row_ids: &[i64],
    ) -> Result<Vec<String>, StoreError>;

    async fn delete(
        &self,
        conn: &mut SqliteConnection,
        row_ids: &[i64],
    ) -> Result<(), StoreError>;

    async fn similarity_search(
        &self,
        conn: &mut SqliteConnection,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredText>, StoreError>;
}

pub struct SqliteVectorStore {
    table: String,
    provider: Arc<dyn EmbeddingProvider>,
}

impl SqliteVectorStore {
    /// `table` must be a bare identifier (validated at config load).
    pub fn new(table: impl Into<String>, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            table: table.into(),
            provider,
        }
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn add_texts(
        &self,
        conn: &mut SqliteConnection,
        texts: &[String],
        metadatas: &[serde_json::Value],
    ) -> Result<Vec<i64>, StoreError> {
        let vectors = self
            .provider
            .embed(texts)
            .await
            .map_err(StoreError::Embedding)?;

        let sql = format!(
            "INSERT INTO {} (text, metadata, embedding) VALUES (?, ?, ?)",
            self.table
        );
        let mut row_ids = Vec::with_capacity(texts.len());
        for (i, text) in texts.iter().enumerate() {
            let metadata = metadatas
                .get(i)
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            let result = sqlx::query(&sql)
                .bind(text)
                .bind(metadata.to_string())
                .bind(vec_to_blob(&vectors[i]))
                .execute(&mut *conn)
                .await?;
            row_ids.push(result.last_insert_rowid());
        }
        Ok(row_ids)
    }

    async fn texts_by_row_ids(
        &self,
        conn: &mut SqliteConnection,
        row_ids: &[i64],
    ) -> Result<Vec<String>, StoreError> {
        if row_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; row_ids.len()].join(", ");
        let sql = format!(
            "SELECT text FROM {} WHERE rowid IN ({placeholders}) ORDER BY rowid",
            self.table
        );
        let mut query = sqlx::query_scalar::<_, String>(&sql);
        for id in row_ids {
            query = query.bind(id);
        }
        Ok(query.fetch_all(&mut *conn).await?)
    }

    async fn delete(
        &self,
        conn: &mut SqliteConnection,
        row_ids: &[i64],
    ) -> Result<(), StoreError> {
        if row_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; row_ids.len()].join(", ");
        let sql = format!(
            "DELETE FROM {} WHERE rowid IN ({placeholders})",
            self.table
        );
        let mut query = sqlx::query(&sql);
        for id in row_ids {
            query = query.bind(id);
        }
        query.execute(&mut *conn).await?;
        Ok(())
    }

    async fn similarity_search(
        &self,
        conn: &mut SqliteConnection,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredText>, StoreError> {
        let query_vec = self
            .provider
            .embed(std::slice::from_ref(&query.to_string()))
            .await
            .map_err(StoreError::Embedding)?
            .into_iter()
            .next()
            .unwrap_or_default();

        let sql = format!(
            "SELECT rowid, text, metadata, embedding FROM {}",
            self.table
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;

        let mut scored: Vec<ScoredText> = rows
            .into_iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let metadata: String = row.get("metadata");
                ScoredText {
                    row_id: row.get("rowid"),
                    text: row.get("text"),
                    metadata: serde_json::from_str(&metadata)
                        .unwrap_or(serde_json::Value::Null),
                    score: cosine_similarity(&query_vec, &blob_to_vec(&blob)),
                }
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(k);
        Ok(scored)
    }
}
