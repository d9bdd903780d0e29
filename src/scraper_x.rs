//! X scraper: archived tweet exports plus a Google News RSS fallback.
//!
//! The platform API is closed, so "live" data comes from two side doors:
//! JSON export files dropped into a directory, and the Google News RSS
//! search feed for each followed account.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::{parse_duration, XConfig};
use crate::error::ScrapeError;
use crate::models::{DataOrigin, ScrapedMessage};
use crate::scraper::Scraper;
use crate::sink::MessageSink;

/// Timestamp format tweet exports use, e.g. `Sat Apr 13 19:23:01 +0000 2024`.
const TWEET_DATE_FORMAT: &str = "%a %b %d %H:%M:%S %z %Y";

const FEED_TIMEOUT: Duration = Duration::from_secs(10);
const FEED_BACKOFF_CAP: Duration = Duration::from_secs(60);

pub struct XScraperContext {
    pub user_tweets_json_directory: PathBuf,
    pub accounts_to_follow: Vec<String>,
    pub poll_interval: Option<Duration>,
}

impl XScraperContext {
    pub fn from_config(config: &XConfig) -> anyhow::Result<Self> {
        Ok(Self {
            user_tweets_json_directory: config.user_tweets_json_directory.clone(),
            accounts_to_follow: config.accounts_to_follow.clone(),
            poll_interval: config
                .poll_interval
                .as_deref()
                .map(parse_duration)
                .transpose()?,
        })
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("feed returned status {0}")]
    Status(u16),

    #[error("feed body is not valid rss: {0}")]
    Parse(#[from] feed_rs::parser::ParseFeedError),
}

impl FeedError {
    fn is_transient(&self) -> bool {
        match self {
            FeedError::Request(err) => err.is_timeout() || err.is_connect(),
            FeedError::Status(code) => *code == 429 || *code >= 500,
            FeedError::Parse(_) => false,
        }
    }
}

/// A tweet pulled out of an export file.
#[derive(Debug, PartialEq)]
struct ExportedTweet {
    full_text: String,
    created_at: DateTime<Utc>,
}

/// Recursively collect tweet objects from an export document. A tweet is
/// any JSON object carrying a string `full_text` and a parseable string
/// `created_at`; everything else is wrapping to descend through.
fn collect_tweets(value: &serde_json::Value, out: &mut Vec<ExportedTweet>) {
    match value {
        serde_json::Value::Object(map) => {
            let text = map.get("full_text").and_then(|v| v.as_str());
            let date = map.get("created_at").and_then(|v| v.as_str());
            if let (Some(text), Some(date)) = (text, date) {
                match DateTime::parse_from_str(date, TWEET_DATE_FORMAT) {
                    Ok(parsed) => {
                        out.push(ExportedTweet {
                            full_text: text.to_string(),
                            created_at: parsed.with_timezone(&Utc),
                        });
                        return;
                    }
                    Err(_) => {
                        warn!(raw = date, "unparseable tweet date, skipping tweet");
                        return;
                    }
                }
            }
            for nested in map.values() {
                collect_tweets(nested, out);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_tweets(item, out);
            }
        }
        _ => {}
    }
}

pub struct XScraper {
    ctx: XScraperContext,
    client: reqwest::Client,
}

impl XScraper {
    pub fn new(ctx: XScraperContext) -> anyhow::Result<Self> {
        Ok(Self {
            ctx,
            client: reqwest::Client::builder().timeout(FEED_TIMEOUT).build()?,
        })
    }

    /// One pass over every `*.json` export in the configured directory.
    /// Unreadable or unparseable files are skipped with a warning.
    fn scrape_exports(&self, sink: &MessageSink) {
        let dir = &self.ctx.user_tweets_json_directory;
        if !dir.is_dir() {
            warn!(path = %dir.display(), "tweet export directory does not exist");
            return;
        }
        for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let document: serde_json::Value = match std::fs::read_to_string(path)
                .map_err(anyhow::Error::from)
                .and_then(|raw| Ok(serde_json::from_str(&raw)?))
            {
                Ok(document) => document,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable export");
                    continue;
                }
            };

            let mut tweets = Vec::new();
            collect_tweets(&document, &mut tweets);
            info!(path = %path.display(), count = tweets.len(), "scraped tweet export");
            for tweet in tweets {
                let message = ScrapedMessage {
                    // Exports carry no stable id, so the text doubles as the
                    // identifier.
                    identifier: tweet.full_text.clone(),
                    data: tweet.full_text,
                    origin: DataOrigin::X,
                    scraped_at: Utc::now(),
                    pub_date: tweet.created_at,
                };
                if sink.put(message).is_err() {
                    warn!("sink closed while emitting tweets");
                    return;
                }
            }
        }
    }

    async fn fetch_feed(&self, account: &str) -> Result<feed_rs::model::Feed, FeedError> {
        let url = format!("https://news.google.com/rss/search?q=site:x.com/{account}");
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(FeedError::Status(response.status().as_u16()));
        }
        let body = response.bytes().await?;
        Ok(feed_rs::parser::parse(body.as_ref())?)
    }

    /// Fetch one account's feed, retrying transient failures with
    /// randomized exponential backoff, capped but unbounded in attempts.
    async fn fetch_feed_with_retry(&self, account: &str) -> Result<feed_rs::model::Feed, FeedError> {
        let mut attempt: u32 = 0;
        loop {
            match self.fetch_feed(account).await {
                Ok(feed) => return Ok(feed),
                Err(err) if err.is_transient() => {
                    let cap = FEED_BACKOFF_CAP
                        .min(Duration::from_secs(1u64 << attempt.min(6)));
                    let delay = rand::thread_rng().gen_range(Duration::ZERO..=cap);
                    warn!(
                        account,
                        attempt,
                        backoff_ms = delay.as_millis() as u64,
                        error = %err,
                        "feed fetch failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn scrape_feeds(&self, sink: &MessageSink) -> Result<(), FeedError> {
        for account in &self.ctx.accounts_to_follow {
            let feed = self.fetch_feed_with_retry(account).await?;
            let mut emitted = 0usize;
            for entry in feed.entries {
                let Some(title) = entry.title.map(|t| t.content) else {
                    warn!(account, "feed entry without a title, skipping");
                    continue;
                };
                let Some(published) = entry.published else {
                    warn!(account, title, "feed entry without a date, skipping");
                    continue;
                };
                let message = ScrapedMessage {
                    data: title.clone(),
                    origin: DataOrigin::X,
                    scraped_at: Utc::now(),
                    pub_date: published,
                    identifier: title,
                };
                if sink.put(message).is_err() {
                    warn!("sink closed while emitting feed entries");
                    return Ok(());
                }
                emitted += 1;
            }
            info!(account, emitted, "scraped news feed");
        }
        Ok(())
    }
}

#[async_trait]
impl Scraper for XScraper {
    fn origin(&self) -> DataOrigin {
        DataOrigin::X
    }

    async fn run(&self, sink: MessageSink) -> Result<(), ScrapeError> {
        loop {
            self.scrape_exports(&sink);
            self.scrape_feeds(&sink)
                .await
                .map_err(|err| ScrapeError::failed(DataOrigin::X, anyhow!(err)))?;

            match self.ctx.poll_interval {
                Some(interval) => tokio::time::sleep(interval).await,
                None => return Err(ScrapeError::Stopped(DataOrigin::X)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collects_tweets_from_nested_documents() {
        let document = serde_json::json!({
            "profile": { "name": "someone" },
            "tweets": [
                {
                    "tweet": {
                        "full_text": "first",
                        "created_at": "Sat Apr 13 19:23:01 +0000 2024",
                        "retweets": 3
                    }
                },
                {
                    "tweet": {
                        "full_text": "second",
                        "created_at": "Sun Apr 14 08:00:00 +0000 2024"
                    }
                }
            ]
        });

        let mut tweets = Vec::new();
        collect_tweets(&document, &mut tweets);
        assert_eq!(tweets.len(), 2);
        assert_eq!(tweets[0].full_text, "first");
        assert_eq!(
            tweets[0].created_at.to_rfc3339(),
            "2024-04-13T19:23:01+00:00"
        );
    }

    #[test]
    fn skips_bad_dates_and_non_tweet_objects() {
        let document = serde_json::json!([
            { "full_text": "broken", "created_at": "not a date" },
            { "full_text": 42, "created_at": "Sat Apr 13 19:23:01 +0000 2024" },
            { "unrelated": true },
            { "full_text": "good", "created_at": "Sat Apr 13 19:23:01 +0000 2024" }
        ]);

        let mut tweets = Vec::new();
        collect_tweets(&document, &mut tweets);
        assert_eq!(tweets.len(), 1);
        assert_eq!(tweets[0].full_text, "good");
    }

    #[test]
    fn does_not_descend_into_matched_tweets() {
        // A tweet containing a quoted tweet yields one envelope, not two.
        let document = serde_json::json!({
            "full_text": "outer",
            "created_at": "Sat Apr 13 19:23:01 +0000 2024",
            "quoted_status": {
                "full_text": "inner",
                "created_at": "Sat Apr 13 10:00:00 +0000 2024"
            }
        });

        let mut tweets = Vec::new();
        collect_tweets(&document, &mut tweets);
        assert_eq!(tweets.len(), 1);
        assert_eq!(tweets[0].full_text, "outer");
    }
}
