//! Scraper trait and orchestration.
//!
//! Each source implements [`Scraper`]; the orchestrator spawns every scraper
//! onto the runtime, optionally wrapped in a retry policy that restarts the
//! whole scraper with exponential backoff. A scraper only ends by returning
//! its terminal [`ScrapeError::Stopped`] signal or a failure; the
//! orchestrator never cancels a running scraper.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::error::ScrapeError;
use crate::models::DataOrigin;
use crate::sink::MessageSink;

/// A long-running or one-shot procedure producing envelopes into the sink.
#[async_trait]
pub trait Scraper: Send + Sync + 'static {
    fn origin(&self) -> DataOrigin;

    /// Run until the source is exhausted (`Err(Stopped)`) or a structural
    /// failure occurs. Never returns `Ok` from a poll-forever configuration.
    async fn run(&self, sink: MessageSink) -> Result<(), ScrapeError>;
}

/// Restart policy for a failed scraper: exponential backoff with base 1s
/// capped at 10s, optionally bounded in attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        exp.min(self.cap)
    }
}

/// Spawn every scraper onto `set`, each feeding a clone of `sink`.
///
/// With a retry policy, any error except the scraper's own terminal
/// `Stopped` signal restarts it after backoff. One join-set entry per
/// scraper; collect them with `set.join_next()`.
pub fn spawn_scrapers(
    set: &mut JoinSet<Result<(), ScrapeError>>,
    sink: &MessageSink,
    scrapers: Vec<Arc<dyn Scraper>>,
    retry: Option<RetryPolicy>,
) {
    for scraper in scrapers {
        let sink = sink.clone();
        set.spawn(async move {
            match retry {
                Some(policy) => run_with_retry(scraper, sink, policy).await,
                None => scraper.run(sink).await,
            }
        });
    }
}

async fn run_with_retry(
    scraper: Arc<dyn Scraper>,
    sink: MessageSink,
    policy: RetryPolicy,
) -> Result<(), ScrapeError> {
    let origin = scraper.origin();
    let mut attempt: u32 = 0;
    loop {
        info!(%origin, attempt, "starting scraper");
        match scraper.run(sink.clone()).await {
            Err(stopped @ ScrapeError::Stopped(_)) => {
                info!(%origin, "scraper stopped");
                return Err(stopped);
            }
            Err(err) => {
                if let Some(max) = policy.max_attempts {
                    if attempt + 1 >= max {
                        warn!(%origin, attempt, error = %err, "scraper failed, retries exhausted");
                        return Err(err);
                    }
                }
                let delay = policy.delay(attempt);
                warn!(
                    %origin,
                    attempt,
                    backoff_secs = delay.as_secs(),
                    error = %err,
                    "scraper failed, restarting after backoff"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Ok(()) => {
                info!(%origin, "scraper finished");
                return Ok(());
            }
        }
    }
}
