//! GitHub scraper: repository file sync, issue crawling, webhook server.
//!
//! On startup every followed repository is cloned or pulled and its tracked
//! (or changed) files are emitted as envelopes, followed by a full issue
//! crawl. With `run_server` set, a long-lived `POST /webhook` endpoint
//! re-syncs single repositories and single issues on signed GitHub events.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::GithubConfig;
use crate::error::ScrapeError;
use crate::git::{self, GitError, NO_PRIOR_REF};
use crate::models::{DataOrigin, ScrapedMessage};
use crate::scraper::Scraper;
use crate::sink::MessageSink;

type HmacSha256 = Hmac<Sha256>;

const API_TIMEOUT: Duration = Duration::from_secs(5);
const COMMENTS_TIMEOUT: Duration = Duration::from_secs(3);
const API_MAX_ATTEMPTS: u32 = 3;

/// A followed repository, canonical key `owner/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GitRepository {
    pub owner: String,
    pub name: String,
}

impl GitRepository {
    pub fn from_full_name(full_name: &str) -> Option<Self> {
        let (owner, name) = full_name.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some(Self {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    fn working_copy(&self, base: &Path) -> PathBuf {
        base.join(&self.owner).join(&self.name)
    }
}

/// Everything the GitHub scraper needs, secrets included.
///
/// Secrets come from the environment exactly once, at construction;
/// a missing variable aborts startup.
pub struct GithubScraperContext {
    pub host: String,
    pub port: u16,
    pub repository_base_path: PathBuf,
    pub repositories_to_follow: HashSet<GitRepository>,
    pub run_server: bool,
    pub webhook_secret: String,
    pub personal_access_token: String,
    pub clone_url_base: String,
    pub api_base_url: String,
}

impl GithubScraperContext {
    pub fn from_config(config: &GithubConfig) -> anyhow::Result<Self> {
        let repositories_to_follow = config
            .repositories_to_follow
            .iter()
            .map(|full_name| {
                GitRepository::from_full_name(full_name)
                    .ok_or_else(|| anyhow!("invalid repository '{full_name}', expected owner/name"))
            })
            .collect::<anyhow::Result<HashSet<_>>>()?;

        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            repository_base_path: config.repository_base_path.clone(),
            repositories_to_follow,
            run_server: config.run_server,
            webhook_secret: std::env::var("GITHUB_WEBHOOK_SECRET")
                .context("GITHUB_WEBHOOK_SECRET is not set")?,
            personal_access_token: std::env::var("GITHUB_PERSONAL_ACCESS_TOKEN")
                .context("GITHUB_PERSONAL_ACCESS_TOKEN is not set")?,
            clone_url_base: "https://github.com".to_string(),
            api_base_url: "https://api.github.com".to_string(),
        })
    }
}

// ============ Issue API client ============

#[derive(Debug, Error)]
pub enum GithubApiError {
    #[error("github api returned {status} for {url}")]
    Status {
        status: StatusCode,
        url: String,
    },

    #[error("github api request failed: {0}")]
    Request(#[from] reqwest::Error),
}

impl GithubApiError {
    pub fn is_transient(&self) -> bool {
        match self {
            GithubApiError::Status { status, .. } => {
                status.as_u16() == 429 || status.is_server_error()
            }
            GithubApiError::Request(err) => err.is_timeout() || err.is_connect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct IssueDto {
    number: i64,
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    assignee: Option<UserDto>,
    comments_url: String,
    updated_at: String,
}

#[derive(Debug, Deserialize)]
struct UserDto {
    login: String,
}

#[derive(Debug, Deserialize)]
struct CommentDto {
    user: UserDto,
    #[serde(default)]
    body: Option<String>,
}

struct GithubIssue {
    number: i64,
    title: String,
    assignee_login: Option<String>,
    body: Option<String>,
    comments: Vec<(String, String)>,
    updated_at: DateTime<Utc>,
}

/// Thin typed client over the issues REST API.
pub struct GithubApi {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl GithubApi {
    pub fn new(token: &str, base_url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .user_agent(concat!("magpie/", env!("CARGO_PKG_VERSION")))
                .build()?,
            token: token.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        timeout: Duration,
    ) -> Result<T, GithubApiError> {
        let mut attempt: u32 = 0;
        loop {
            let result = async {
                let response = self
                    .client
                    .get(url)
                    .bearer_auth(&self.token)
                    .query(query)
                    .timeout(timeout)
                    .send()
                    .await?;
                if !response.status().is_success() {
                    return Err(GithubApiError::Status {
                        status: response.status(),
                        url: url.to_string(),
                    });
                }
                Ok(response.json::<T>().await?)
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < API_MAX_ATTEMPTS => {
                    let delay = Duration::from_secs((1u64 << attempt).min(10));
                    warn!(url, attempt, backoff_secs = delay.as_secs(), error = %err, "retrying github api call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Pages through `/issues` until the server returns an empty page.
    async fn all_issues(&self, repo: &GitRepository) -> Result<Vec<GithubIssue>, GithubApiError> {
        let url = format!(
            "{}/repos/{}/{}/issues",
            self.base_url, repo.owner, repo.name
        );
        let mut issues = Vec::new();
        let mut page = 1u32;
        loop {
            let dtos: Vec<IssueDto> = self
                .get_json(
                    &url,
                    &[("page", page.to_string()), ("state", "all".to_string())],
                    API_TIMEOUT,
                )
                .await?;
            if dtos.is_empty() {
                break;
            }
            info!(count = dtos.len(), page, repo = %repo.full_name(), "fetched issues page");
            for dto in dtos {
                if let Some(issue) = self.hydrate_issue(dto).await? {
                    issues.push(issue);
                }
            }
            page += 1;
        }
        Ok(issues)
    }

    async fn issue_by_url(&self, url: &str) -> Result<Option<GithubIssue>, GithubApiError> {
        let dto: IssueDto = self.get_json(url, &[], API_TIMEOUT).await?;
        self.hydrate_issue(dto).await
    }

    /// Attach comments and parse the timestamp. Malformed timestamps make
    /// the issue unusable as an envelope; skipped with a warning.
    async fn hydrate_issue(&self, dto: IssueDto) -> Result<Option<GithubIssue>, GithubApiError> {
        let comments: Vec<CommentDto> = self
            .get_json(&dto.comments_url, &[], COMMENTS_TIMEOUT)
            .await?;

        let updated_at = match DateTime::parse_from_rfc3339(&dto.updated_at) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(_) => {
                warn!(number = dto.number, raw = %dto.updated_at, "unparseable issue timestamp, skipping");
                return Ok(None);
            }
        };

        if dto.body.is_none() {
            warn!(number = dto.number, "issue has an empty body");
        }

        Ok(Some(GithubIssue {
            number: dto.number,
            title: dto.title,
            assignee_login: dto.assignee.map(|a| a.login),
            body: dto.body,
            comments: comments
                .into_iter()
                .map(|c| (c.user.login, c.body.unwrap_or_else(|| "empty comment".to_string())))
                .collect(),
            updated_at,
        }))
    }
}

fn issue_to_message(repo: &GitRepository, issue: &GithubIssue) -> ScrapedMessage {
    let repository_url = format!("https://github.com/{}", repo.full_name());
    let assignment = match &issue.assignee_login {
        Some(login) => format!("\nAssigned to: @{login}"),
        None => "\nNot assigned yet".to_string(),
    };
    let comments = issue
        .comments
        .iter()
        .map(|(login, text)| format!("From @{login}: {text}"))
        .collect::<Vec<_>>()
        .join("\n");

    let data = format!(
        "GitHub Issue in repository {repository_url}\n title: {}\n url: {repository_url}/issues/{}{assignment}\n\n{}\n\nComments:\n{comments}",
        issue.title,
        issue.number,
        issue.body.as_deref().unwrap_or(""),
    );

    ScrapedMessage {
        data,
        origin: DataOrigin::Github,
        scraped_at: Utc::now(),
        pub_date: issue.updated_at,
        identifier: format!("{}@{}", repo.full_name(), issue.number),
    }
}

// ============ Repository sync ============

/// Clone-or-pull one repository and emit envelopes for new or changed
/// tracked files.
async fn sync_repository(
    ctx: &GithubScraperContext,
    sink: &MessageSink,
    repo: &GitRepository,
) -> Result<(), GitError> {
    let path = repo.working_copy(&ctx.repository_base_path);

    if path.join(".git").exists() {
        info!(repo = %repo.full_name(), "updating working copy");
        git::pull(&path).await?;
        match git::diff_names(&path, "HEAD@{1}", "HEAD").await {
            Ok(changed) => emit_files(sink, repo, &path, &changed).await,
            Err(err) if err.exit_code() == Some(NO_PRIOR_REF) => {
                info!(repo = %repo.full_name(), "nothing to update");
            }
            Err(err) => return Err(err),
        }
    } else {
        let owner_dir = ctx.repository_base_path.join(&repo.owner);
        std::fs::create_dir_all(&owner_dir)?;
        let url = format!("{}/{}", ctx.clone_url_base, repo.full_name());
        info!(repo = %repo.full_name(), "cloning");
        git::clone(&owner_dir, &url, &repo.name).await?;
        let tracked = git::ls_files(&path).await?;
        emit_files(sink, repo, &path, &tracked).await;
    }

    Ok(())
}

/// One envelope per readable text file; unreadable or vanished files are
/// skipped with a warning.
async fn emit_files(sink: &MessageSink, repo: &GitRepository, repo_path: &Path, files: &[String]) {
    for file in files {
        let full = repo_path.join(file);
        if !full.is_file() {
            warn!(repo = %repo.full_name(), file, "listed path is not a readable file");
            continue;
        }
        let data = match std::fs::read(&full).map(String::from_utf8) {
            Ok(Ok(text)) => text,
            Ok(Err(_)) => {
                warn!(repo = %repo.full_name(), file, "not valid utf-8, skipping");
                continue;
            }
            Err(err) => {
                warn!(repo = %repo.full_name(), file, error = %err, "failed to read file");
                continue;
            }
        };

        let pub_date = match git::last_commit_date(repo_path, file).await {
            Ok(date) => date,
            Err(err) => {
                warn!(repo = %repo.full_name(), file, error = %err, "no commit date, skipping");
                continue;
            }
        };

        let message = ScrapedMessage {
            data,
            origin: DataOrigin::Github,
            scraped_at: Utc::now(),
            pub_date,
            identifier: format!("{}@{}", repo.full_name(), file),
        };
        if sink.put(message).is_err() {
            warn!("sink closed while emitting files");
            return;
        }
    }
}

// ============ Scraper ============

pub struct GithubScraper {
    ctx: Arc<GithubScraperContext>,
    api: Arc<GithubApi>,
}

impl GithubScraper {
    pub fn new(ctx: GithubScraperContext) -> anyhow::Result<Self> {
        let api = GithubApi::new(&ctx.personal_access_token, &ctx.api_base_url)?;
        Ok(Self {
            ctx: Arc::new(ctx),
            api: Arc::new(api),
        })
    }

    async fn scrape_issues(&self, sink: &MessageSink, repo: &GitRepository) -> Result<(), GithubApiError> {
        let issues = self.api.all_issues(repo).await?;
        for issue in &issues {
            if sink.put(issue_to_message(repo, issue)).is_err() {
                warn!("sink closed while emitting issues");
                return Ok(());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Scraper for GithubScraper {
    fn origin(&self) -> DataOrigin {
        DataOrigin::Github
    }

    async fn run(&self, sink: MessageSink) -> Result<(), ScrapeError> {
        let ctx = &self.ctx;
        if !ctx.repository_base_path.exists() {
            info!(path = %ctx.repository_base_path.display(), "creating repository base path");
            std::fs::create_dir_all(&ctx.repository_base_path)
                .map_err(|err| ScrapeError::failed(DataOrigin::Github, err))?;
        }

        info!(
            count = ctx.repositories_to_follow.len(),
            "syncing followed repositories"
        );
        for repo in &ctx.repositories_to_follow {
            // One repository's failure must not abort the batch, except a
            // clone failure, which leaves nothing to scrape at all.
            match sync_repository(ctx, &sink, repo).await {
                Ok(()) => {}
                Err(err) if repo.working_copy(&ctx.repository_base_path).exists() => {
                    error!(repo = %repo.full_name(), error = %err, "sync failed, continuing");
                }
                Err(err) => {
                    return Err(ScrapeError::failed(
                        DataOrigin::Github,
                        anyhow!(err).context(format!("cloning {}", repo.full_name())),
                    ))
                }
            }
        }

        info!("downloading issues");
        for repo in &ctx.repositories_to_follow {
            self.scrape_issues(&sink, repo)
                .await
                .map_err(|err| ScrapeError::failed(DataOrigin::Github, err))?;
        }

        if !ctx.run_server {
            return Err(ScrapeError::Stopped(DataOrigin::Github));
        }

        let state = Arc::new(WebhookState {
            ctx: Arc::clone(ctx),
            sink: sink.clone(),
            api: Arc::clone(&self.api),
            repo_locks: Mutex::new(HashMap::new()),
        });
        let bind_addr = format!("{}:{}", ctx.host, ctx.port);
        info!(%bind_addr, "starting github webhook server");
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .map_err(|err| ScrapeError::failed(DataOrigin::Github, err))?;
        axum::serve(listener, webhook_router(state))
            .await
            .map_err(|err| ScrapeError::failed(DataOrigin::Github, err))?;

        Err(ScrapeError::Stopped(DataOrigin::Github))
    }
}

// ============ Webhook server ============

/// Dependencies of the webhook handler, passed at construction.
pub struct WebhookState {
    pub ctx: Arc<GithubScraperContext>,
    pub sink: MessageSink,
    pub api: Arc<GithubApi>,
    /// Serializes webhook-triggered syncs per repository so concurrent
    /// deliveries never interleave working-copy mutation.
    repo_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl WebhookState {
    pub fn new(ctx: Arc<GithubScraperContext>, sink: MessageSink, api: Arc<GithubApi>) -> Self {
        Self {
            ctx,
            sink,
            api,
            repo_locks: Mutex::new(HashMap::new()),
        }
    }

    fn repo_lock(&self, full_name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.repo_locks.lock().expect("repo lock map poisoned");
        Arc::clone(
            locks
                .entry(full_name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}

pub fn webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhook", post(handle_webhook))
        .fallback(handle_not_found)
        .with_state(state)
}

/// Compute the `X-Hub-Signature-256` header value for a payload. Exposed
/// so deployments can self-test their webhook wiring.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a `sha256=<hex>` signature.
fn verify_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    let Some(hex_digest) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

async fn handle_not_found() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|value| value.to_str().ok());
    let valid = signature
        .map(|sig| verify_signature(&state.ctx.webhook_secret, &body, sig))
        .unwrap_or(false);
    if !valid {
        warn!("webhook signature missing or invalid");
        return StatusCode::FORBIDDEN.into_response();
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            error!(error = %err, "failed to parse webhook payload");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let event = headers
        .get("X-GitHub-Event")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let full_name = payload
        .pointer("/repository/full_name")
        .and_then(|v| v.as_str());

    match (event, full_name) {
        ("push", Some(full_name)) => {
            info!(full_name, "received push event");
            match followed_repo(&state.ctx, full_name) {
                Some(repo) => {
                    let _guard = state.repo_lock(full_name).lock_owned().await;
                    if let Err(err) = sync_repository(&state.ctx, &state.sink, &repo).await {
                        error!(full_name, error = %err, "webhook-triggered sync failed");
                    }
                }
                None => warn!(full_name, "push event for unfollowed repository, skipping"),
            }
        }
        ("issues" | "issue_comment", Some(full_name)) => {
            info!(full_name, event, "received issue event");
            let issue_url = payload.pointer("/issue/url").and_then(|v| v.as_str());
            match (followed_repo(&state.ctx, full_name), issue_url) {
                (Some(repo), Some(url)) => match state.api.issue_by_url(url).await {
                    Ok(Some(issue)) => {
                        let _ = state.sink.put(issue_to_message(&repo, &issue));
                        info!(full_name, number = issue.number, "issue updated");
                    }
                    Ok(None) => {}
                    Err(err) => error!(url, error = %err, "failed to re-fetch issue"),
                },
                (None, _) => warn!(full_name, "issue event for unfollowed repository, skipping"),
                (_, None) => warn!(full_name, "issue event without an issue url"),
            }
        }
        (other, _) => {
            warn!(event = other, "received unknown webhook event");
        }
    }

    (StatusCode::OK, Json(serde_json::json!({"status": "OK"}))).into_response()
}

fn followed_repo(ctx: &GithubScraperContext, full_name: &str) -> Option<GitRepository> {
    let repo = GitRepository::from_full_name(full_name)?;
    ctx.repositories_to_follow.contains(&repo).then_some(repo)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_names() {
        let repo = GitRepository::from_full_name("acme/widgets").unwrap();
        assert_eq!(repo.owner, "acme");
        assert_eq!(repo.name, "widgets");
        assert_eq!(repo.full_name(), "acme/widgets");

        assert!(GitRepository::from_full_name("acme").is_none());
        assert!(GitRepository::from_full_name("acme/").is_none());
        assert!(GitRepository::from_full_name("a/b/c").is_none());
    }

    #[test]
    fn signature_round_trip() {
        let secret = "s3cr3t";
        let body = br#"{"zen":"Design for failure."}"#;
        let header = sign(secret, body);
        assert!(header.starts_with("sha256="));
        assert!(verify_signature(secret, body, &header));
        assert!(!verify_signature("wrong", body, &header));
        assert!(!verify_signature(secret, b"tampered", &header));
        assert!(!verify_signature(secret, body, "sha256=zz"));
        assert!(!verify_signature(secret, body, "md5=abc"));
    }

    #[test]
    fn issue_message_layout() {
        let repo = GitRepository::from_full_name("acme/widgets").unwrap();
        let issue = GithubIssue {
            number: 7,
            title: "Crash on start".to_string(),
            assignee_login: Some("alice".to_string()),
            body: Some("It crashes.".to_string()),
            comments: vec![("bob".to_string(), "Repro confirmed".to_string())],
            updated_at: Utc::now(),
        };

        let message = issue_to_message(&repo, &issue);
        assert_eq!(message.identifier, "acme/widgets@7");
        assert_eq!(message.origin, DataOrigin::Github);
        assert!(message.data.contains("title: Crash on start"));
        assert!(message.data.contains("Assigned to: @alice"));
        assert!(message.data.contains("From @bob: Repro confirmed"));
        assert!(message
            .data
            .contains("https://github.com/acme/widgets/issues/7"));
    }

    #[test]
    fn unassigned_issue_message() {
        let repo = GitRepository::from_full_name("acme/widgets").unwrap();
        let issue = GithubIssue {
            number: 8,
            title: "Question".to_string(),
            assignee_login: None,
            body: None,
            comments: Vec::new(),
            updated_at: Utc::now(),
        };
        let message = issue_to_message(&repo, &issue);
        assert!(message.data.contains("Not assigned yet"));
    }
}
