use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    pub scrapers: ScrapersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

fn default_overlap() -> usize {
    0
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_table_name")]
    pub table_name: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            table_name: default_table_name(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_table_name() -> String {
    "embeddings".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Per-source scraper sections. Absent sections disable the source; at
/// least one must be present.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ScrapersConfig {
    pub github: Option<GithubConfig>,
    pub telegram: Option<TelegramConfig>,
    pub x: Option<XConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubConfig {
    #[serde(default = "default_github_port")]
    pub port: u16,
    #[serde(default = "default_github_host")]
    pub host: String,
    #[serde(default = "default_repository_base_path")]
    pub repository_base_path: PathBuf,
    /// `owner/name` pairs.
    pub repositories_to_follow: Vec<String>,
    #[serde(default = "default_true")]
    pub run_server: bool,
}

fn default_github_port() -> u16 {
    8000
}
fn default_github_host() -> String {
    "localhost".to_string()
}
fn default_repository_base_path() -> PathBuf {
    PathBuf::from("github-repositories")
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    /// Base URL of the MTProto HTTP gateway.
    pub api_url: String,
    #[serde(default)]
    pub groups_ids: Vec<i64>,
    #[serde(default)]
    pub forums_ids: Vec<i64>,
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
    #[serde(default = "default_true")]
    pub process_new: bool,
}

fn default_history_depth() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct XConfig {
    pub user_tweets_json_directory: PathBuf,
    #[serde(default)]
    pub accounts_to_follow: Vec<String>,
    /// Duration string (`"30s"`, `"5m"`, `"2h"`, `"1d"`). Absent means a
    /// single pass followed by the terminal stopped signal.
    #[serde(default)]
    pub poll_interval: Option<String>,
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.overlap >= config.chunking.chunk_size {
        bail!("chunking.overlap must be smaller than chunking.chunk_size");
    }

    if !config
        .embedding
        .table_name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || config.embedding.table_name.is_empty()
    {
        bail!(
            "embedding.table_name must be a bare identifier, got '{}'",
            config.embedding.table_name
        );
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "hash" => {}
        other => bail!("Unknown embedding provider: '{}'. Must be disabled, openai, or hash.", other),
    }
    if config.embedding.provider == "openai" {
        if config.embedding.model.is_none() {
            bail!("embedding.model must be specified for the openai provider");
        }
        if config.embedding.dims.unwrap_or(0) == 0 {
            bail!("embedding.dims must be > 0 for the openai provider");
        }
    }

    let scrapers = &config.scrapers;
    if scrapers.github.is_none() && scrapers.telegram.is_none() && scrapers.x.is_none() {
        bail!("At least one scraper must be configured under [scrapers]");
    }

    if let Some(x) = &scrapers.x {
        if let Some(raw) = &x.poll_interval {
            parse_duration(raw)?;
        }
    }

    Ok(config)
}

/// Parse the `"<number><unit>"` duration grammar: seconds, minutes, hours,
/// days.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let mut chars = raw.chars();
    let unit = chars.next_back();
    let value: u64 = chars
        .as_str()
        .parse()
        .with_context(|| format!("Invalid duration format: {raw}"))?;
    let secs = match unit {
        Some('s') => value,
        Some('m') => value * 60,
        Some('h') => value * 3600,
        Some('d') => value * 86_400,
        _ => bail!("Invalid duration format: {raw}"),
    };
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn multibyte_unit_is_an_error_not_a_panic() {
        // Cyrillic м: looks like "m", must fail cleanly.
        assert!(parse_duration("5м").is_err());
        assert!(parse_duration("5分").is_err());
        assert!(parse_duration("м").is_err());
    }

    #[test]
    fn parses_minimal_config() {
        let raw = r#"
[db]
path = "data/magpie.sqlite"

[chunking]
chunk_size = 1000
overlap = 100

[scrapers.x]
user_tweets_json_directory = "exports"
accounts_to_follow = ["rustlang"]
poll_interval = "30m"
"#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.chunking.chunk_size, 1000);
        assert!(!config.embedding.is_enabled());
        let x = config.scrapers.x.unwrap();
        assert_eq!(x.accounts_to_follow, vec!["rustlang"]);
        assert_eq!(x.poll_interval.as_deref(), Some("30m"));
    }

    #[test]
    fn github_defaults_apply() {
        let raw = r#"
repositories_to_follow = ["acme/widgets"]
"#;
        let github: GithubConfig = toml::from_str(raw).unwrap();
        assert_eq!(github.port, 8000);
        assert_eq!(github.host, "localhost");
        assert!(github.run_server);
    }
}
