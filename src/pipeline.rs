//! Ingestion / dedup pipeline: the sole consumer of the sink.
//!
//! For each envelope: split into chunks, hash the identifier, compare the
//! incoming chunk set against whatever is stored for that identifier, and
//! replace it atomically when it changed. Identical content is a no-op, so
//! re-ingestion is idempotent. A single bad message never kills the loop.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::chunk::TextSplitter;
use crate::models::ScrapedMessage;
use crate::sink::MessageStream;
use crate::vector_store::{StoreError, VectorStore};

/// Bounded retries for ordinary processing failures. Sqlite "busy" is
/// exempt and retried indefinitely.
const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, PartialEq, Eq)]
enum Ingested {
    Unchanged,
    Replaced { chunks: usize },
}

pub struct IngestPipeline {
    pool: SqlitePool,
    store: Arc<dyn VectorStore>,
    splitter: TextSplitter,
}

impl IngestPipeline {
    pub fn new(pool: SqlitePool, store: Arc<dyn VectorStore>, splitter: TextSplitter) -> Self {
        Self {
            pool,
            store,
            splitter,
        }
    }

    /// Consume the stream until the sink is shut down and drained.
    pub async fn run(self, mut stream: MessageStream) -> Result<()> {
        while let Some(message) = stream.get().await {
            if message.pub_date > message.scraped_at {
                warn!(
                    identifier = %message.identifier,
                    pub_date = %message.pub_date,
                    scraped_at = %message.scraped_at,
                    "publication date is after scrape time"
                );
            }
            let lag = Utc::now() - message.scraped_at;
            debug!(
                identifier = %message.identifier,
                lag_secs = lag.num_seconds(),
                "picked up message"
            );
            self.process_with_retry(&message).await;
        }
        info!("sink drained, pipeline finished");
        Ok(())
    }

    /// Process one envelope; retry transient failures, drop the message
    /// after the budget is spent. Never propagates.
    async fn process_with_retry(&self, message: &ScrapedMessage) {
        let mut attempt: u32 = 0;
        loop {
            match self.process(message).await {
                Ok(Ingested::Unchanged) => {
                    debug!(identifier = %message.identifier, "content unchanged, skipping");
                    return;
                }
                Ok(Ingested::Replaced { chunks }) => {
                    info!(
                        identifier = %message.identifier,
                        origin = %message.origin,
                        chunks,
                        "stored message"
                    );
                    return;
                }
                Err(err) if err.is_busy() => {
                    // Contention, not failure: wait and try again without
                    // burning the attempt budget.
                    warn!(identifier = %message.identifier, "database busy, retrying");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        error!(
                            identifier = %message.identifier,
                            error = %err,
                            "dropping message after {MAX_ATTEMPTS} attempts"
                        );
                        return;
                    }
                    let delay = Duration::from_secs(1 << attempt.min(3));
                    warn!(
                        identifier = %message.identifier,
                        attempt,
                        backoff_secs = delay.as_secs(),
                        error = %err,
                        "processing failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn process(&self, message: &ScrapedMessage) -> Result<Ingested, StoreError> {
        let chunks = self.splitter.split(&message.data);
        let identifier_hash = hash_identifier(&message.identifier);

        let mut tx = self.pool.begin().await?;

        let existing_ids: Vec<i64> = sqlx::query_scalar(
            "SELECT embedding_row_id FROM identifier_to_rowid
             WHERE identifier_hash = ? ORDER BY embedding_row_id",
        )
        .bind(&identifier_hash)
        .fetch_all(&mut *tx)
        .await?;

        let stored = self.store.texts_by_row_ids(&mut tx, &existing_ids).await?;
        if stored == chunks {
            return Ok(Ingested::Unchanged);
        }

        // Stale rows go away with their dedup records, then the fresh chunk
        // set lands, all inside this one transaction. A failure anywhere
        // rolls the whole envelope back.
        self.store.delete(&mut tx, &existing_ids).await?;
        sqlx::query("DELETE FROM identifier_to_rowid WHERE identifier_hash = ?")
            .bind(&identifier_hash)
            .execute(&mut *tx)
            .await?;

        let metadatas: Vec<serde_json::Value> = (0..chunks.len())
            .map(|index| {
                serde_json::json!({
                    "identifier": message.identifier,
                    "origin": message.origin,
                    "pub_date": message.pub_date.to_rfc3339(),
                    "scraped_at": message.scraped_at.to_rfc3339(),
                    "chunk": index,
                })
            })
            .collect();
        let new_ids = self.store.add_texts(&mut tx, &chunks, &metadatas).await?;

        for row_id in &new_ids {
            sqlx::query(
                "INSERT INTO identifier_to_rowid (embedding_row_id, identifier_hash) VALUES (?, ?)",
            )
            .bind(row_id)
            .bind(&identifier_hash)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Ingested::Replaced {
            chunks: new_ids.len(),
        })
    }
}

/// Fixed-width dedup key: hex SHA-256 of the identifier.
pub fn hash_identifier(identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Log the queue depth periodically while the pipeline runs.
pub async fn log_queue_depth(sink: crate::sink::MessageSink, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        info!(depth = sink.depth(), "sink queue depth");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_hash_is_stable_and_hex() {
        let hash = hash_identifier("acme/widgets@42");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_identifier("acme/widgets@42"));
        assert_ne!(hash, hash_identifier("acme/widgets@43"));
    }
}
