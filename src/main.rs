use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::task::JoinSet;
use tracing::{error, info};

use magpie::chunk::TextSplitter;
use magpie::config::{self, Config};
use magpie::embedding;
use magpie::models::DataOrigin;
use magpie::pipeline::{log_queue_depth, IngestPipeline};
use magpie::scraper::{spawn_scrapers, RetryPolicy, Scraper};
use magpie::scraper_github::{GithubScraper, GithubScraperContext};
use magpie::scraper_telegram::{HttpTelegramApi, TelegramScraper, TelegramScraperContext};
use magpie::scraper_x::{XScraper, XScraperContext};
use magpie::sink;
use magpie::vector_store::SqliteVectorStore;
use magpie::{db, logging, migrate};

const QUEUE_DEPTH_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "magpie", version, about = "Multi-source scraper feeding a local vector store")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "magpie.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database and its tables, then exit.
    Init,
    /// Run a single scraper once, without restarts.
    Scrape {
        #[arg(value_enum)]
        origin: OriginArg,
    },
    /// Run every configured scraper with restarts, plus the ingestion
    /// pipeline, until all sources stop.
    Run,
}

#[derive(Clone, Copy, ValueEnum)]
enum OriginArg {
    Github,
    Telegram,
    X,
}

impl From<OriginArg> for DataOrigin {
    fn from(arg: OriginArg) -> Self {
        match arg {
            OriginArg::Github => DataOrigin::Github,
            OriginArg::Telegram => DataOrigin::Telegram,
            OriginArg::X => DataOrigin::X,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Command::Init => init(&config).await,
        Command::Scrape { origin } => scrape_once(&config, origin.into()).await,
        Command::Run => run_all(&config).await,
    }
}

async fn init(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool, &config.embedding.table_name).await?;
    info!(path = %config.db.path.display(), "database initialized");
    Ok(())
}

/// Build the scraper for one origin from its config section.
fn build_scraper(config: &Config, origin: DataOrigin) -> Result<Arc<dyn Scraper>> {
    match origin {
        DataOrigin::Github => {
            let Some(github) = &config.scrapers.github else {
                bail!("[scrapers.github] is not configured");
            };
            let ctx = GithubScraperContext::from_config(github)?;
            Ok(Arc::new(GithubScraper::new(ctx)?))
        }
        DataOrigin::Telegram => {
            let Some(telegram) = &config.scrapers.telegram else {
                bail!("[scrapers.telegram] is not configured");
            };
            let ctx = TelegramScraperContext::from_config(telegram)?;
            let api = Arc::new(HttpTelegramApi::new(&telegram.api_url)?);
            Ok(Arc::new(TelegramScraper::new(ctx, api)))
        }
        DataOrigin::X => {
            let Some(x) = &config.scrapers.x else {
                bail!("[scrapers.x] is not configured");
            };
            Ok(Arc::new(XScraper::new(XScraperContext::from_config(x)?)?))
        }
    }
}

fn build_pipeline(config: &Config, pool: sqlx::SqlitePool) -> Result<IngestPipeline> {
    let provider = embedding::create_provider(&config.embedding)?;
    let store = Arc::new(SqliteVectorStore::new(
        config.embedding.table_name.clone(),
        provider,
    ));
    let splitter = TextSplitter::new(config.chunking.chunk_size, config.chunking.overlap);
    Ok(IngestPipeline::new(pool, store, splitter))
}

/// One pass of a single scraper without the ingestion pipeline; drained
/// envelopes are logged. The scraper's terminal stopped signal counts as
/// success, anything else is surfaced.
async fn scrape_once(config: &Config, origin: DataOrigin) -> Result<()> {
    let scraper = build_scraper(config, origin)?;
    let (sink, mut stream) = sink::channel();
    let consumer = tokio::spawn(async move {
        let mut count = 0usize;
        while let Some(message) = stream.get().await {
            info!(
                identifier = %message.identifier,
                pub_date = %message.pub_date,
                bytes = message.data.len(),
                "scraped"
            );
            count += 1;
        }
        count
    });

    let result = scraper.run(sink.clone()).await;
    drop(sink);
    let count = consumer.await?;
    info!(%origin, count, "scrape pass complete");

    match result {
        Ok(()) => Ok(()),
        Err(err) if err.is_stopped() => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn run_all(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::run_migrations(&pool, &config.embedding.table_name).await?;

    let mut scrapers: Vec<Arc<dyn Scraper>> = Vec::new();
    if config.scrapers.github.is_some() {
        scrapers.push(build_scraper(config, DataOrigin::Github)?);
    }
    if config.scrapers.telegram.is_some() {
        scrapers.push(build_scraper(config, DataOrigin::Telegram)?);
    }
    if config.scrapers.x.is_some() {
        scrapers.push(build_scraper(config, DataOrigin::X)?);
    }
    info!(count = scrapers.len(), "starting scrapers");

    let pipeline = build_pipeline(config, pool)?;
    let (sink, stream) = sink::channel();
    let consumer = tokio::spawn(pipeline.run(stream));
    let depth_logger = tokio::spawn(log_queue_depth(sink.clone(), QUEUE_DEPTH_LOG_INTERVAL));

    let mut set = JoinSet::new();
    spawn_scrapers(&mut set, &sink, scrapers, Some(RetryPolicy::default()));
    drop(sink);

    let mut failures = 0usize;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_stopped() => {}
            Ok(Err(err)) => {
                error!(error = %err, "scraper gave up");
                failures += 1;
            }
            Err(join_err) => {
                error!(error = %join_err, "scraper task panicked");
                failures += 1;
            }
        }
    }

    // Every producer handle is gone now, so the stream drains and ends.
    depth_logger.abort();
    consumer.await??;

    if failures > 0 {
        bail!("{failures} scraper(s) failed");
    }
    Ok(())
}
