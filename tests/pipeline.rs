//! End-to-end ingestion: sink in, sqlite rows out.

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqlitePool;
use tempfile::TempDir;

use magpie::chunk::TextSplitter;
use magpie::config::{ChunkingConfig, Config, DbConfig, EmbeddingConfig, ScrapersConfig};
use magpie::embedding::HashProvider;
use magpie::models::{DataOrigin, ScrapedMessage};
use magpie::pipeline::{hash_identifier, IngestPipeline};
use magpie::vector_store::{SqliteVectorStore, VectorStore};
use magpie::{db, migrate, sink};

struct Harness {
    _dir: TempDir,
    pool: SqlitePool,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let config = Config {
        db: DbConfig {
            path: dir.path().join("magpie.sqlite"),
        },
        chunking: ChunkingConfig {
            chunk_size: 40,
            overlap: 0,
        },
        embedding: EmbeddingConfig::default(),
        scrapers: ScrapersConfig::default(),
    };
    let pool = db::connect(&config).await.unwrap();
    migrate::run_migrations(&pool, "embeddings").await.unwrap();
    Harness { _dir: dir, pool }
}

fn store() -> Arc<SqliteVectorStore> {
    Arc::new(SqliteVectorStore::new(
        "embeddings",
        Arc::new(HashProvider::new(16)),
    ))
}

fn message(identifier: &str, data: &str) -> ScrapedMessage {
    let now = Utc::now();
    ScrapedMessage {
        data: data.to_string(),
        origin: DataOrigin::Github,
        scraped_at: now,
        pub_date: now,
        identifier: identifier.to_string(),
    }
}

async fn ingest(pool: &SqlitePool, messages: Vec<ScrapedMessage>) {
    let pipeline = IngestPipeline::new(pool.clone(), store(), TextSplitter::new(40, 0));
    let (tx, rx) = sink::channel();
    for m in messages {
        tx.put(m).unwrap();
    }
    drop(tx);
    pipeline.run(rx).await.unwrap();
}

async fn stored_texts(pool: &SqlitePool, identifier: &str) -> Vec<String> {
    sqlx::query_scalar(
        "SELECT e.text FROM embeddings e
         JOIN identifier_to_rowid d ON d.embedding_row_id = e.rowid
         WHERE d.identifier_hash = ? ORDER BY e.rowid",
    )
    .bind(hash_identifier(identifier))
    .fetch_all(pool)
    .await
    .unwrap()
}

async fn total_rows(pool: &SqlitePool) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM embeddings")
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn stores_chunks_with_dedup_records() {
    let h = harness().await;
    let long = "alpha ".repeat(20); // forces several chunks
    ingest(&h.pool, vec![message("doc-1", &long)]).await;

    let texts = stored_texts(&h.pool, "doc-1").await;
    assert!(texts.len() > 1);
    assert_eq!(texts.concat().replace(' ', ""), long.replace(' ', ""));
    assert_eq!(total_rows(&h.pool).await, texts.len() as i64);
}

#[tokio::test]
async fn reingesting_identical_content_is_a_noop() {
    let h = harness().await;
    ingest(&h.pool, vec![message("doc-1", "same content")]).await;
    let before: Vec<i64> = sqlx::query_scalar("SELECT rowid FROM embeddings ORDER BY rowid")
        .fetch_all(&h.pool)
        .await
        .unwrap();

    ingest(&h.pool, vec![message("doc-1", "same content")]).await;
    let after: Vec<i64> = sqlx::query_scalar("SELECT rowid FROM embeddings ORDER BY rowid")
        .fetch_all(&h.pool)
        .await
        .unwrap();

    // Same physical rows, not rewrites.
    assert_eq!(before, after);
}

#[tokio::test]
async fn changed_content_replaces_old_chunks() {
    let h = harness().await;
    ingest(&h.pool, vec![message("doc-1", "version one")]).await;
    ingest(&h.pool, vec![message("doc-1", "version two")]).await;

    let texts = stored_texts(&h.pool, "doc-1").await;
    assert_eq!(texts, vec!["version two".to_string()]);
    assert_eq!(total_rows(&h.pool).await, 1);
}

#[tokio::test]
async fn identifiers_do_not_interfere() {
    let h = harness().await;
    ingest(
        &h.pool,
        vec![message("doc-1", "first doc"), message("doc-2", "second doc")],
    )
    .await;
    ingest(&h.pool, vec![message("doc-1", "first doc, revised")]).await;

    assert_eq!(
        stored_texts(&h.pool, "doc-2").await,
        vec!["second doc".to_string()]
    );
    assert_eq!(
        stored_texts(&h.pool, "doc-1").await,
        vec!["first doc, revised".to_string()]
    );
}

#[tokio::test]
async fn similarity_search_finds_exact_text_first() {
    let h = harness().await;
    ingest(
        &h.pool,
        vec![
            message("doc-1", "rust ownership rules"),
            message("doc-2", "sqlite storage internals"),
        ],
    )
    .await;

    let store = store();
    let mut conn = h.pool.acquire().await.unwrap();
    let hits = store
        .similarity_search(&mut conn, "sqlite storage internals", 1)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].text, "sqlite storage internals");
    assert!((hits[0].score - 1.0).abs() < 1e-6);
    assert_eq!(hits[0].metadata["identifier"], "doc-2");
}
