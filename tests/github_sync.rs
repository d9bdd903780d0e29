//! Full GitHub scraper pass against a local git origin and a mocked
//! issues API: clone, file envelopes, pagination, incremental re-sync.

use std::collections::HashSet;
use std::path::Path;
use std::process::Command;

use httpmock::prelude::*;
use tempfile::TempDir;

use magpie::error::ScrapeError;
use magpie::models::DataOrigin;
use magpie::scraper::Scraper;
use magpie::scraper_github::{GitRepository, GithubScraper, GithubScraperContext};
use magpie::sink;

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args([
            "-c",
            "user.name=Test",
            "-c",
            "user.email=test@example.com",
        ])
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

/// A local `acme/widgets` origin with two committed files.
fn make_origin(base: &Path) -> std::path::PathBuf {
    let repo = base.join("acme").join("widgets");
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "-b", "main"]);
    std::fs::write(repo.join("readme.md"), "hello widgets\n").unwrap();
    std::fs::write(repo.join("notes.txt"), "some notes\n").unwrap();
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "initial"]);
    repo
}

fn context(origin_base: &Path, clone_base: &Path, api_base: &str) -> GithubScraperContext {
    GithubScraperContext {
        host: "127.0.0.1".to_string(),
        port: 0,
        repository_base_path: clone_base.to_path_buf(),
        repositories_to_follow: HashSet::from([
            GitRepository::from_full_name("acme/widgets").unwrap()
        ]),
        run_server: false,
        webhook_secret: "unused".to_string(),
        personal_access_token: "unused-token".to_string(),
        clone_url_base: origin_base.display().to_string(),
        api_base_url: api_base.to_string(),
    }
}

async fn run_pass(ctx: GithubScraperContext) -> Vec<magpie::models::ScrapedMessage> {
    let scraper = GithubScraper::new(ctx).unwrap();
    let (tx, mut rx) = sink::channel();
    let result = scraper.run(tx.clone()).await;
    assert!(matches!(
        result,
        Err(ScrapeError::Stopped(DataOrigin::Github))
    ));
    drop(tx);
    let mut messages = Vec::new();
    while let Some(message) = rx.get().await {
        messages.push(message);
    }
    messages
}

#[tokio::test]
async fn clones_then_syncs_incrementally() {
    let origins = TempDir::new().unwrap();
    let clones = TempDir::new().unwrap();
    let origin_repo = make_origin(origins.path());

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/repos/acme/widgets/issues");
            then.status(200).json_body(serde_json::json!([]));
        })
        .await;

    // First pass clones and emits every tracked file.
    let messages = run_pass(context(origins.path(), clones.path(), &server.base_url())).await;
    let mut identifiers: Vec<_> = messages.iter().map(|m| m.identifier.clone()).collect();
    identifiers.sort();
    assert_eq!(
        identifiers,
        vec!["acme/widgets@notes.txt", "acme/widgets@readme.md"]
    );
    let readme = messages
        .iter()
        .find(|m| m.identifier.ends_with("readme.md"))
        .unwrap();
    assert_eq!(readme.data, "hello widgets\n");
    assert_eq!(readme.origin, DataOrigin::Github);

    // No upstream changes: pull finds nothing, no envelopes.
    let messages = run_pass(context(origins.path(), clones.path(), &server.base_url())).await;
    assert!(messages.is_empty(), "unexpected: {messages:?}");

    // One upstream commit: exactly the changed file is re-emitted.
    std::fs::write(origin_repo.join("notes.txt"), "updated notes\n").unwrap();
    git(&origin_repo, &["add", "."]);
    git(&origin_repo, &["commit", "-m", "update notes"]);

    let messages = run_pass(context(origins.path(), clones.path(), &server.base_url())).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].identifier, "acme/widgets@notes.txt");
    assert_eq!(messages[0].data, "updated notes\n");
}

#[tokio::test]
async fn paginates_issues_and_formats_envelopes() {
    let origins = TempDir::new().unwrap();
    let clones = TempDir::new().unwrap();
    make_origin(origins.path());

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/repos/acme/widgets/issues")
                .query_param("page", "1")
                .query_param("state", "all");
            then.status(200).json_body(serde_json::json!([{
                "number": 7,
                "title": "Crash on start",
                "body": "It crashes.",
                "assignee": { "login": "alice" },
                "comments_url": format!("{}/comments/7", server.base_url()),
                "updated_at": "2024-05-02T12:33:11Z"
            }]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/repos/acme/widgets/issues")
                .query_param("page", "2");
            then.status(200).json_body(serde_json::json!([]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/comments/7");
            then.status(200).json_body(serde_json::json!([
                { "user": { "login": "bob" }, "body": "Repro confirmed" }
            ]));
        })
        .await;

    let messages = run_pass(context(origins.path(), clones.path(), &server.base_url())).await;
    let issue = messages
        .iter()
        .find(|m| m.identifier == "acme/widgets@7")
        .expect("issue envelope missing");

    assert!(issue.data.contains("title: Crash on start"));
    assert!(issue.data.contains("Assigned to: @alice"));
    assert!(issue.data.contains("It crashes."));
    assert!(issue.data.contains("From @bob: Repro confirmed"));
    assert_eq!(
        issue.pub_date.to_rfc3339(),
        "2024-05-02T12:33:11+00:00"
    );
}
