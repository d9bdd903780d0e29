//! X export scraping from a directory of JSON dumps.

use tempfile::TempDir;

use magpie::error::ScrapeError;
use magpie::models::DataOrigin;
use magpie::scraper::Scraper;
use magpie::scraper_x::{XScraper, XScraperContext};
use magpie::sink;

#[tokio::test]
async fn scrapes_export_directory_once_and_stops() {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("dump.json"),
        serde_json::json!({
            "tweets": [
                { "tweet": { "full_text": "shipping it", "created_at": "Sat Apr 13 19:23:01 +0000 2024" } },
                { "tweet": { "full_text": "rolled back", "created_at": "Sun Apr 14 08:00:00 +0000 2024" } }
            ]
        })
        .to_string(),
    )
    .unwrap();
    // Ignored: wrong extension and broken JSON.
    std::fs::write(dir.path().join("notes.txt"), "not an export").unwrap();
    std::fs::write(dir.path().join("broken.json"), "{ nope").unwrap();

    let scraper = XScraper::new(XScraperContext {
        user_tweets_json_directory: dir.path().to_path_buf(),
        accounts_to_follow: vec![],
        poll_interval: None,
    })
    .unwrap();

    let (tx, mut rx) = sink::channel();
    let result = scraper.run(tx.clone()).await;
    assert!(matches!(result, Err(ScrapeError::Stopped(DataOrigin::X))));

    drop(tx);
    let mut messages = Vec::new();
    while let Some(message) = rx.get().await {
        messages.push(message);
    }

    let mut texts: Vec<_> = messages.iter().map(|m| m.data.clone()).collect();
    texts.sort();
    assert_eq!(texts, vec!["rolled back", "shipping it"]);
    for message in &messages {
        assert_eq!(message.origin, DataOrigin::X);
        assert_eq!(message.identifier, message.data);
    }
}

#[tokio::test]
async fn missing_directory_is_not_fatal() {
    let scraper = XScraper::new(XScraperContext {
        user_tweets_json_directory: "/nonexistent/exports".into(),
        accounts_to_follow: vec![],
        poll_interval: None,
    })
    .unwrap();

    let (tx, _rx) = sink::channel();
    let result = scraper.run(tx).await;
    assert!(matches!(result, Err(ScrapeError::Stopped(DataOrigin::X))));
}
