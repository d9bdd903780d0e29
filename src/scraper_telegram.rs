//! Telegram scraper: bounded history backfill plus a live update loop.
//!
//! Talks to an MTProto HTTP gateway through the [`TelegramApi`] trait so
//! tests can substitute a scripted implementation. Plain groups get their
//! recent history directly; forums are walked topic by topic.

use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::TelegramConfig;
use crate::error::ScrapeError;
use crate::models::{DataOrigin, ScrapedMessage};
use crate::scraper::Scraper;
use crate::sink::MessageSink;

/// Largest topic page the gateway will return in one call.
const TOPIC_PAGE_LIMIT: usize = 100;

/// Group and forum ids to follow. A chat id must not appear in both lists.
#[derive(Debug, Clone)]
pub struct PeersConfig {
    pub groups_ids: Vec<i64>,
    pub forums_ids: Vec<i64>,
}

impl PeersConfig {
    pub fn new(groups_ids: Vec<i64>, forums_ids: Vec<i64>) -> anyhow::Result<Self> {
        if groups_ids.is_empty() && forums_ids.is_empty() {
            bail!("telegram: at least one group or forum id must be configured");
        }
        let groups: HashSet<_> = groups_ids.iter().collect();
        if let Some(id) = forums_ids.iter().find(|id| groups.contains(id)) {
            bail!("telegram: chat {id} is listed as both a group and a forum");
        }
        Ok(Self {
            groups_ids,
            forums_ids,
        })
    }

    pub fn all_ids(&self) -> HashSet<i64> {
        self.groups_ids
            .iter()
            .chain(self.forums_ids.iter())
            .copied()
            .collect()
    }
}

pub struct TelegramScraperContext {
    pub peers: PeersConfig,
    pub history_depth: usize,
    pub process_new: bool,
}

impl TelegramScraperContext {
    pub fn from_config(config: &TelegramConfig) -> anyhow::Result<Self> {
        Ok(Self {
            peers: PeersConfig::new(config.groups_ids.clone(), config.forums_ids.clone())?,
            history_depth: config.history_depth,
            process_new: config.process_new,
        })
    }
}

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("telegram rpc error {code}: {message}")]
    Rpc { code: u16, message: String },

    #[error("telegram transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("telegram session disconnected")]
    Disconnected,
}

impl TelegramError {
    pub fn is_transient(&self) -> bool {
        match self {
            TelegramError::Rpc { code, .. } => *code == 429 || *code >= 500,
            TelegramError::Transport(err) => err.is_timeout() || err.is_connect(),
            TelegramError::Disconnected => false,
        }
    }
}

/// A chat participant or chat reference as the gateway reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PeerRef {
    User { id: i64 },
    Chat { id: i64 },
    Channel { id: i64 },
}

impl PeerRef {
    pub fn id(&self) -> i64 {
        match self {
            PeerRef::User { id } | PeerRef::Chat { id } | PeerRef::Channel { id } => *id,
        }
    }
}

/// A message as the gateway returns it, before conversion to an envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct RawMessage {
    pub id: i64,
    pub peer: PeerRef,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForumTopic {
    pub id: i64,
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct TopicPage {
    pub topics: Vec<ForumTopic>,
    pub total: usize,
}

/// The gateway operations the scraper needs. Implemented over HTTP in
/// production and by scripted fakes in tests.
#[async_trait]
pub trait TelegramApi: Send + Sync {
    /// Most recent `limit` messages of a plain group, newest first.
    async fn group_history(&self, chat_id: i64, limit: usize)
        -> Result<Vec<RawMessage>, TelegramError>;

    /// First page of a forum's topics.
    async fn forum_topics(&self, chat_id: i64) -> Result<TopicPage, TelegramError>;

    /// Most recent `limit` replies in one forum topic, newest first.
    async fn topic_replies(
        &self,
        chat_id: i64,
        topic_id: i64,
        limit: usize,
    ) -> Result<Vec<RawMessage>, TelegramError>;

    /// Long-poll the next live update from any chat the session can see.
    async fn next_message(&self) -> Result<RawMessage, TelegramError>;
}

// ============ HTTP gateway client ============

#[derive(Debug, Deserialize)]
struct RpcError {
    code: u16,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcReply<T> {
    Err { error: RpcError },
    Ok(T),
}

#[derive(Debug, Deserialize)]
struct UpdatesBatch {
    #[serde(default)]
    messages: Vec<RawMessage>,
    #[serde(default)]
    next_offset: Option<i64>,
}

/// Client for the MTProto HTTP gateway. The bearer token comes from
/// `TELEGRAM_API_TOKEN`.
pub struct HttpTelegramApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
    /// Long-poll offset plus messages from the last batch not yet handed
    /// out one at a time.
    poll_state: Mutex<PollState>,
}

#[derive(Default)]
struct PollState {
    offset: Option<i64>,
    buffered: VecDeque<RawMessage>,
}

impl HttpTelegramApi {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: std::env::var("TELEGRAM_API_TOKEN")
                .context("TELEGRAM_API_TOKEN is not set")?,
            poll_state: Mutex::new(PollState::default()),
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, TelegramError> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .bearer_auth(&self.token)
            .json(&params)
            .send()
            .await?;

        // The gateway signals a dead session with 410.
        if response.status().as_u16() == 410 {
            return Err(TelegramError::Disconnected);
        }
        if !response.status().is_success() {
            return Err(TelegramError::Rpc {
                code: response.status().as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        match response.json::<RpcReply<T>>().await? {
            RpcReply::Ok(value) => Ok(value),
            RpcReply::Err { error } => Err(TelegramError::Rpc {
                code: error.code,
                message: error.message,
            }),
        }
    }
}

#[async_trait]
impl TelegramApi for HttpTelegramApi {
    async fn group_history(
        &self,
        chat_id: i64,
        limit: usize,
    ) -> Result<Vec<RawMessage>, TelegramError> {
        self.call(
            "messages.getHistory",
            serde_json::json!({ "chat_id": chat_id, "limit": limit }),
        )
        .await
    }

    async fn forum_topics(&self, chat_id: i64) -> Result<TopicPage, TelegramError> {
        self.call(
            "channels.getForumTopics",
            serde_json::json!({ "chat_id": chat_id, "limit": TOPIC_PAGE_LIMIT }),
        )
        .await
    }

    async fn topic_replies(
        &self,
        chat_id: i64,
        topic_id: i64,
        limit: usize,
    ) -> Result<Vec<RawMessage>, TelegramError> {
        self.call(
            "messages.getReplies",
            serde_json::json!({ "chat_id": chat_id, "topic_id": topic_id, "limit": limit }),
        )
        .await
    }

    async fn next_message(&self) -> Result<RawMessage, TelegramError> {
        let mut state = self.poll_state.lock().await;
        loop {
            if let Some(message) = state.buffered.pop_front() {
                return Ok(message);
            }
            let batch: UpdatesBatch = self
                .call(
                    "updates.poll",
                    serde_json::json!({ "offset": state.offset }),
                )
                .await?;
            if let Some(next) = batch.next_offset {
                state.offset = Some(next);
            }
            state.buffered.extend(batch.messages);
        }
    }
}

// ============ Scraper ============

pub struct TelegramScraper {
    ctx: TelegramScraperContext,
    api: Arc<dyn TelegramApi>,
}

impl TelegramScraper {
    pub fn new(ctx: TelegramScraperContext, api: Arc<dyn TelegramApi>) -> Self {
        Self { ctx, api }
    }

    async fn backfill_group(&self, sink: &MessageSink, chat_id: i64) -> Result<(), TelegramError> {
        let history = self
            .api
            .group_history(chat_id, self.ctx.history_depth)
            .await?;
        info!(chat_id, count = history.len(), "backfilled group history");
        emit_raw(sink, history);
        Ok(())
    }

    async fn backfill_forum(&self, sink: &MessageSink, chat_id: i64) -> Result<(), TelegramError> {
        let page = self.api.forum_topics(chat_id).await?;
        if page.total > page.topics.len() {
            warn!(
                chat_id,
                total = page.total,
                fetched = page.topics.len(),
                "forum has more topics than one page, older topics are not backfilled"
            );
        }
        for topic in &page.topics {
            let replies = self
                .api
                .topic_replies(chat_id, topic.id, self.ctx.history_depth)
                .await?;
            info!(chat_id, topic = %topic.title, count = replies.len(), "backfilled topic");
            emit_raw(sink, replies);
        }
        Ok(())
    }
}

/// Convert raw messages to envelopes and push them. Empty texts and
/// dateless messages are skipped with a warning.
fn emit_raw(sink: &MessageSink, messages: Vec<RawMessage>) {
    for raw in messages {
        let Some(message) = convert(raw) else { continue };
        if sink.put(message).is_err() {
            warn!("sink closed while emitting telegram messages");
            return;
        }
    }
}

fn convert(raw: RawMessage) -> Option<ScrapedMessage> {
    if raw.text.trim().is_empty() {
        warn!(chat_id = raw.peer.id(), message_id = raw.id, "empty message text, skipping");
        return None;
    }
    let Some(date) = raw.date else {
        warn!(chat_id = raw.peer.id(), message_id = raw.id, "message has no date, skipping");
        return None;
    };
    Some(ScrapedMessage {
        data: raw.text,
        origin: DataOrigin::Telegram,
        scraped_at: Utc::now(),
        pub_date: date,
        identifier: format!("{}:{}", raw.peer.id(), raw.id),
    })
}

#[async_trait]
impl Scraper for TelegramScraper {
    fn origin(&self) -> DataOrigin {
        DataOrigin::Telegram
    }

    async fn run(&self, sink: MessageSink) -> Result<(), ScrapeError> {
        for &chat_id in &self.ctx.peers.groups_ids {
            // A single inaccessible chat must not abort the backfill.
            if let Err(err) = self.backfill_group(&sink, chat_id).await {
                if let TelegramError::Disconnected = err {
                    return Err(ScrapeError::Stopped(DataOrigin::Telegram));
                }
                warn!(chat_id, error = %err, "group backfill failed, continuing");
            }
        }
        for &chat_id in &self.ctx.peers.forums_ids {
            if let Err(err) = self.backfill_forum(&sink, chat_id).await {
                if let TelegramError::Disconnected = err {
                    return Err(ScrapeError::Stopped(DataOrigin::Telegram));
                }
                warn!(chat_id, error = %err, "forum backfill failed, continuing");
            }
        }

        if !self.ctx.process_new {
            return Err(ScrapeError::Stopped(DataOrigin::Telegram));
        }

        info!("listening for live telegram updates");
        let followed = self.ctx.peers.all_ids();
        loop {
            match self.api.next_message().await {
                Ok(raw) => {
                    if !followed.contains(&raw.peer.id()) {
                        continue;
                    }
                    if let Some(message) = convert(raw) {
                        if sink.put(message).is_err() {
                            return Err(ScrapeError::Stopped(DataOrigin::Telegram));
                        }
                    }
                }
                Err(TelegramError::Disconnected) => {
                    info!("telegram session disconnected");
                    return Err(ScrapeError::Stopped(DataOrigin::Telegram));
                }
                Err(err) if err.is_transient() => {
                    warn!(error = %err, "transient telegram error, continuing");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(err) => {
                    return Err(ScrapeError::failed(DataOrigin::Telegram, anyhow!(err)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink;

    struct ScriptedApi {
        history: Vec<RawMessage>,
        topics: TopicPage,
        replies: Vec<RawMessage>,
    }

    #[async_trait]
    impl TelegramApi for ScriptedApi {
        async fn group_history(
            &self,
            _chat_id: i64,
            limit: usize,
        ) -> Result<Vec<RawMessage>, TelegramError> {
            Ok(self.history.iter().take(limit).cloned().collect())
        }

        async fn forum_topics(&self, _chat_id: i64) -> Result<TopicPage, TelegramError> {
            Ok(TopicPage {
                topics: self.topics.topics.clone(),
                total: self.topics.total,
            })
        }

        async fn topic_replies(
            &self,
            _chat_id: i64,
            _topic_id: i64,
            limit: usize,
        ) -> Result<Vec<RawMessage>, TelegramError> {
            Ok(self.replies.iter().take(limit).cloned().collect())
        }

        async fn next_message(&self) -> Result<RawMessage, TelegramError> {
            Err(TelegramError::Disconnected)
        }
    }

    fn raw(id: i64, chat_id: i64, text: &str) -> RawMessage {
        RawMessage {
            id,
            peer: PeerRef::Chat { id: chat_id },
            text: text.to_string(),
            date: Some(Utc::now()),
        }
    }

    #[test]
    fn rejects_overlapping_peer_lists() {
        assert!(PeersConfig::new(vec![1, 2], vec![2, 3]).is_err());
        assert!(PeersConfig::new(vec![], vec![]).is_err());
        let peers = PeersConfig::new(vec![1], vec![2]).unwrap();
        assert_eq!(peers.all_ids(), HashSet::from([1, 2]));
    }

    #[tokio::test]
    async fn backfill_respects_history_depth_and_skips_junk() {
        let mut history: Vec<RawMessage> = (0..10).map(|i| raw(i, 10, &format!("msg {i}"))).collect();
        history[1].text = "   ".to_string();
        history[2].date = None;

        let api = Arc::new(ScriptedApi {
            history,
            topics: TopicPage {
                topics: vec![],
                total: 0,
            },
            replies: vec![],
        });
        let ctx = TelegramScraperContext {
            peers: PeersConfig::new(vec![10], vec![]).unwrap(),
            history_depth: 5,
            process_new: false,
        };
        let scraper = TelegramScraper::new(ctx, api);

        let (tx, mut rx) = sink::channel();
        let result = scraper.run(tx.clone()).await;
        assert!(matches!(result, Err(ScrapeError::Stopped(DataOrigin::Telegram))));

        drop(tx);
        let mut got = Vec::new();
        while let Some(message) = rx.get().await {
            got.push(message);
        }
        // depth 5, minus one empty and one dateless
        assert_eq!(got.len(), 3);
        for message in &got {
            assert!(message.identifier.starts_with("10:"));
            assert_eq!(message.origin, DataOrigin::Telegram);
        }
    }

    #[tokio::test]
    async fn forum_backfill_walks_topics() {
        let api = Arc::new(ScriptedApi {
            history: vec![],
            topics: TopicPage {
                topics: vec![
                    ForumTopic {
                        id: 1,
                        title: "general".to_string(),
                    },
                    ForumTopic {
                        id: 2,
                        title: "help".to_string(),
                    },
                ],
                total: 2,
            },
            replies: vec![raw(100, 20, "reply")],
        });
        let ctx = TelegramScraperContext {
            peers: PeersConfig::new(vec![], vec![20]).unwrap(),
            history_depth: 50,
            process_new: false,
        };
        let scraper = TelegramScraper::new(ctx, api);

        let (tx, mut rx) = sink::channel();
        let _ = scraper.run(tx.clone()).await;
        drop(tx);
        let mut got = Vec::new();
        while let Some(message) = rx.get().await {
            got.push(message);
        }
        // one reply per topic
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].identifier, "20:100");
    }
}
