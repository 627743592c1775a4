//! Best-effort publishing of successful sources.
//!
//! [`GitPublisher`] commits one file into a throwaway repository and pushes it
//! to `main` of the configured remote. When the push is rejected it escalates
//! through force-with-lease and then fetch+merge before giving up.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::Command;

use crate::config::PublishConfig;
use crate::util::mask_credentials;

const TARGET_REF: &str = "HEAD:refs/heads/main";

/// Receives sources that ran successfully.
#[async_trait]
pub trait ArtifactPublisher: Send + Sync {
    async fn publish(&self, task_id: &str, file_name: &str, text: &str) -> anyhow::Result<()>;
}

/// Publisher used when publishing is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

#[async_trait]
impl ArtifactPublisher for NoopPublisher {
    async fn publish(&self, task_id: &str, file_name: &str, _text: &str) -> anyhow::Result<()> {
        tracing::debug!(task_id, file_name, "Publishing disabled, skipping");
        Ok(())
    }
}

/// Pick the publisher for `config`: git when auto-push is on and a remote is set.
pub fn from_config(config: &PublishConfig) -> Arc<dyn ArtifactPublisher> {
    match (&config.remote, config.auto_push) {
        (Some(remote), true) => Arc::new(GitPublisher::new(remote.clone())),
        (None, true) => {
            tracing::info!("CODE_ARTIFACTS not set; publishing disabled");
            Arc::new(NoopPublisher)
        }
        _ => Arc::new(NoopPublisher),
    }
}

#[derive(Debug, Clone)]
pub struct GitPublisher {
    remote: String,
}

struct GitOutput {
    success: bool,
    message: String,
}

async fn git(args: &[&str], repo: &Path) -> anyhow::Result<GitOutput> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to run git")?;

    let stderr = String::from_utf8_lossy(&output.stderr);
    let message = if stderr.trim().is_empty() {
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    } else {
        stderr.trim().to_string()
    };
    Ok(GitOutput {
        success: output.status.success(),
        message,
    })
}

async fn git_ok(args: &[&str], repo: &Path) -> anyhow::Result<()> {
    let out = git(args, repo).await?;
    if !out.success {
        bail!("git {} failed: {}", args.first().copied().unwrap_or_default(), out.message);
    }
    Ok(())
}

fn is_rejection(message: &str) -> bool {
    ["non-fast-forward", "fetch first", "rejected"]
        .iter()
        .any(|needle| message.contains(needle))
}

impl GitPublisher {
    pub fn new(remote: String) -> Self {
        Self { remote }
    }

    fn masked_remote(&self) -> String {
        mask_credentials(&self.remote)
    }

    async fn prepare(&self, repo: &Path, task_id: &str, file_name: &str, text: &str) -> anyhow::Result<()> {
        tokio::fs::write(repo.join(file_name), text)
            .await
            .with_context(|| format!("Failed to write {}", file_name))?;
        git_ok(&["init", "--quiet"], repo).await?;
        git_ok(&["config", "user.email", "pipeline@localhost"], repo).await?;
        git_ok(&["config", "user.name", "Artifact Pipeline"], repo).await?;
        git_ok(&["add", "--", file_name], repo).await?;
        let message = format!("Add successful source for task {}: {}", task_id, file_name);
        git_ok(&["commit", "--quiet", "-m", message.as_str()], repo).await?;
        git_ok(&["remote", "add", "origin", self.remote.as_str()], repo).await?;
        Ok(())
    }

    /// Fetch `main` and try each merge strategy in turn, pushing after the first that applies.
    async fn merge_and_push(&self, repo: &Path) -> anyhow::Result<bool> {
        let fetch = git(&["fetch", "--quiet", "origin", "main"], repo).await?;
        if !fetch.success {
            tracing::warn!(message = %fetch.message, "Failed to fetch origin/main");
            return Ok(false);
        }

        let strategies: [&[&str]; 3] = [
            &["merge", "--no-edit", "origin/main"],
            &["merge", "--no-edit", "--allow-unrelated-histories", "origin/main"],
            &["merge", "--no-edit", "--allow-unrelated-histories", "-X", "theirs", "origin/main"],
        ];
        for args in strategies {
            let merge = git(args, repo).await?;
            if !merge.success {
                tracing::warn!(args = ?args, message = %merge.message, "Merge failed");
                // Leaves the tree clean for the next strategy; fails harmlessly when nothing started.
                let _ = git(&["merge", "--abort"], repo).await;
                continue;
            }
            let push = git(&["push", "--quiet", "origin", TARGET_REF], repo).await?;
            if push.success {
                tracing::info!(args = ?args, "Pushed after merging origin/main");
                return Ok(true);
            }
            tracing::warn!(message = %push.message, "Push after merge failed");
            return Ok(false);
        }
        Ok(false)
    }
}

#[async_trait]
impl ArtifactPublisher for GitPublisher {
    async fn publish(&self, task_id: &str, file_name: &str, text: &str) -> anyhow::Result<()> {
        let remote = self.masked_remote();
        let dir = tempfile::tempdir().context("Failed to create temporary repository")?;
        let repo = dir.path();

        self.prepare(repo, task_id, file_name, text).await?;

        let push = git(&["push", "--quiet", "origin", TARGET_REF], repo).await?;
        if push.success {
            tracing::info!(task_id, file_name, remote = %remote, "Published source");
            return Ok(());
        }
        tracing::warn!(remote = %remote, message = %mask_credentials(&push.message), "Initial push failed");
        if !is_rejection(&push.message) {
            bail!("Push to {} failed", remote);
        }

        let forced = git(&["push", "--quiet", "--force-with-lease", "origin", TARGET_REF], repo).await?;
        if forced.success {
            tracing::info!(task_id, file_name, remote = %remote, "Published source with force-with-lease");
            return Ok(());
        }
        tracing::warn!(message = %mask_credentials(&forced.message), "Force-with-lease push failed");

        if self.merge_and_push(repo).await? {
            tracing::info!(task_id, file_name, remote = %remote, "Published source after merge");
            return Ok(());
        }
        bail!("Unable to publish {} for task {} to {}", file_name, task_id, remote)
    }
}
