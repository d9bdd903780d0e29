//! Git subprocess interface.
//!
//! Every invocation takes an explicit working directory; nothing here
//! mutates the process-wide current directory, so concurrent syncs of
//! different repositories are safe.

use std::path::Path;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::process::Command;

/// Exit code git returns when a ref like `HEAD@{1}` does not exist yet
/// (fresh clone). Treated as "nothing to sync", not an error.
pub const NO_PRIOR_REF: i32 = 128;

#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {command} exited with code {code}: {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("unparseable git output: {0}")]
    Output(String),
}

impl GitError {
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            GitError::Exit { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Run `git <args>` in `dir` and return trimmed stdout lines.
pub async fn git(dir: &Path, args: &[&str]) -> Result<Vec<String>, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .await?;

    if !output.status.success() {
        return Err(GitError::Exit {
            command: args.join(" "),
            code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Clone `url` into `dir/<dest>`.
pub async fn clone(dir: &Path, url: &str, dest: &str) -> Result<(), GitError> {
    git(dir, &["clone", url, dest]).await.map(|_| ())
}

pub async fn pull(repo_dir: &Path) -> Result<(), GitError> {
    git(repo_dir, &["pull"]).await.map(|_| ())
}

/// Names of files that changed between two refs.
pub async fn diff_names(repo_dir: &Path, old: &str, new: &str) -> Result<Vec<String>, GitError> {
    git(repo_dir, &["diff", "--name-only", old, new]).await
}

/// All tracked files, relative to the repository root.
pub async fn ls_files(repo_dir: &Path) -> Result<Vec<String>, GitError> {
    git(repo_dir, &["ls-files"]).await
}

/// Timestamp of the last commit touching `path`.
pub async fn last_commit_date(repo_dir: &Path, path: &str) -> Result<DateTime<Utc>, GitError> {
    let lines = git(
        repo_dir,
        &["log", "-n", "1", "--format=%ad", "--date=iso", "--", path],
    )
    .await?;
    let raw = lines
        .first()
        .ok_or_else(|| GitError::Output(format!("no commit date for {path}")))?;

    // `--date=iso` is git's almost-ISO format: `2024-05-02 12:33:11 +0300`
    DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S %z")
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| GitError::Output(format!("bad commit date '{raw}' for {path}")))
}
