//! magpie: multi-source scraping into a local vector store.
//!
//! Scrapers for GitHub (repositories, issues, webhooks), Telegram (group
//! and forum history plus live updates) and X (tweet exports plus news
//! feeds) push [`models::ScrapedMessage`] envelopes into a shared
//! [`sink`]. A single ingestion pipeline chunks, embeds and upserts them
//! into sqlite, deduplicating by identifier so re-scraping is idempotent.

pub mod chunk;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod git;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod scraper;
pub mod scraper_github;
pub mod scraper_telegram;
pub mod scraper_x;
pub mod sink;
pub mod vector_store;
