//! Core data models flowing through the scraping pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which external system a scraped item came from.
///
/// Immutable once set on a message; also used as the log/CLI display name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataOrigin {
    Github,
    Telegram,
    X,
}

impl fmt::Display for DataOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataOrigin::Github => "github",
            DataOrigin::Telegram => "telegram",
            DataOrigin::X => "x",
        };
        f.write_str(name)
    }
}

/// Normalized unit of scraped content.
///
/// `identifier` is stable across repeated scrapes of the same logical item
/// (file path, issue number, chat message id, tweet text) and is the dedup
/// key downstream. `pub_date` is the source's authored time, `scraped_at`
/// the ingestion wall clock; `pub_date > scraped_at` is logged by the
/// pipeline but never rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedMessage {
    pub data: String,
    pub origin: DataOrigin,
    pub scraped_at: DateTime<Utc>,
    pub pub_date: DateTime<Utc>,
    pub identifier: String,
}
