//! Scraper-level error taxonomy.
//!
//! Per-client errors (HTTP, git, platform RPC) live next to their adapters
//! and carry an explicit transient/permanent classification. This module
//! defines the boundary type every scraper returns to the orchestrator.

use thiserror::Error;

use crate::models::DataOrigin;

/// Terminal outcome of a scraper task.
///
/// `Stopped` marks an intentional, non-error completion (a scraper
/// configured to run once finished its pass, or its long-lived connection
/// was deliberately torn down). The orchestrator's retry wrapper restarts
/// a scraper on `Failed` but never on `Stopped`; the caller decides whether
/// `Stopped` itself is expected or fatal based on run mode.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("{0} scraper completed its run")]
    Stopped(DataOrigin),

    #[error("{origin} scraper failed: {source}")]
    Failed {
        origin: DataOrigin,
        #[source]
        source: anyhow::Error,
    },
}

impl ScrapeError {
    pub fn failed(origin: DataOrigin, source: impl Into<anyhow::Error>) -> Self {
        ScrapeError::Failed {
            origin,
            source: source.into(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ScrapeError::Stopped(_))
    }
}
