//! Repo Workspace Manager (§4.7): clones/updates a repository into an
//! isolated per-task path, serializing concurrent clones of the same repo
//! and reaping old workspaces on a timer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("clone failed: {reason}")]
    CloneFailed { reason: String },
    #[error("authentication failed for {repo}")]
    AuthFailed { repo: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("git command timed out after {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

const GIT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct RepoKey {
    installation_id: String,
    repo_full_name: String,
}

pub struct WorkspaceManager {
    root: PathBuf,
    repo_locks: Mutex<HashMap<RepoKey, Arc<Mutex<()>>>>,
    max_age: Duration,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, max_task_deadline: Duration) -> Arc<Self> {
        Arc::new(Self {
            root: root.into(),
            repo_locks: Mutex::new(HashMap::new()),
            max_age: max_task_deadline * 2,
        })
    }

    async fn lock_for(&self, key: RepoKey) -> Arc<Mutex<()>> {
        let mut locks = self.repo_locks.lock().await;
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Clone `repo_full_name` at `target_ref` into `<root>/<installation>/<repo>/<task-id>`,
    /// serialized per (installation, repo) so concurrent tasks against the
    /// same repo don't race on the same clone target.
    pub async fn acquire(
        &self,
        installation_id: &str,
        repo_full_name: &str,
        target_ref: &str,
        clone_url: &str,
        task_id: Uuid,
    ) -> Result<PathBuf> {
        let key = RepoKey {
            installation_id: installation_id.to_string(),
            repo_full_name: repo_full_name.to_string(),
        };
        let lock = self.lock_for(key).await;
        let _guard = lock.lock().await;

        let path = self
            .root
            .join(installation_id)
            .join(repo_full_name)
            .join(task_id.to_string());
        tokio::fs::create_dir_all(&path).await?;

        run_git(
            &path,
            &[
                "clone",
                "--depth",
                "1",
                "--branch",
                target_ref,
                clone_url,
                ".",
            ],
        )
        .await
        .map_err(|reason| {
            if reason.contains("Authentication") || reason.contains("403") {
                WorkspaceError::AuthFailed {
                    repo: repo_full_name.to_string(),
                }
            } else {
                WorkspaceError::CloneFailed { reason }
            }
        })?;

        Ok(path)
    }

    /// Isolated scratch directory for a task with no associated repository
    /// (Tracker, Chat, ErrorMonitor): no git clone, just a per-task path the
    /// CLI Driver can run in and the reaper can later sweep.
    pub async fn acquire_bare(&self, task_id: Uuid) -> Result<PathBuf> {
        let path = self.root.join("_no-repo").join(task_id.to_string());
        tokio::fs::create_dir_all(&path).await?;
        Ok(path)
    }

    /// Delete a workspace directory. Advisory — the worker calls this on
    /// terminal transition; the reaper also removes stale directories.
    pub async fn release(&self, path: &Path) -> Result<()> {
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }
        Ok(())
    }

    /// Periodic sweep deleting workspaces whose modification time is older
    /// than `max_age` (age-only policy, per the decided open question in
    /// SPEC_FULL.md §9).
    pub async fn reap_stale(&self) -> Result<usize> {
        let mut removed = 0;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    let age = metadata
                        .modified()
                        .ok()
                        .and_then(|m| m.elapsed().ok())
                        .unwrap_or_default();
                    if looks_like_task_workspace(&path) && age > self.max_age {
                        tokio::fs::remove_dir_all(&path).await?;
                        removed += 1;
                    } else {
                        stack.push(path);
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Spawn the periodic reaper as a background task.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match this.reap_stale().await {
                    Ok(n) if n > 0 => tracing::info!(removed = n, "reaped stale workspaces"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "workspace reaper failed"),
                }
            }
        })
    }
}

fn looks_like_task_workspace(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| Uuid::parse_str(n).ok())
        .is_some()
}

/// Run a `git` subcommand with a timeout, returning stderr as the error
/// string on failure. Mirrors the teacher's `execute_direct` host-command
/// shape: pipe stdio, `tokio::time::timeout` the wait, kill on expiry.
async fn run_git(cwd: &Path, args: &[&str]) -> std::result::Result<(), String> {
    let mut child = Command::new("git")
        .current_dir(cwd)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| e.to_string())?;

    let output = tokio::time::timeout(GIT_TIMEOUT, child.wait_with_output()).await;
    match output {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => Err(String::from_utf8_lossy(&output.stderr).into_owned()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("git command timed out".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_bare_skips_git_and_creates_scratch_dir() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path(), Duration::from_secs(1));
        let task_id = Uuid::new_v4();
        let path = manager.acquire_bare(task_id).await.unwrap();
        assert!(path.exists());
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), task_id.to_string());
    }

    #[tokio::test]
    async fn reap_ignores_non_uuid_directories() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path(), Duration::from_secs(1));
        tokio::fs::create_dir_all(dir.path().join("inst").join("acme/widgets")).await.unwrap();
        let removed = manager.reap_stale().await.unwrap();
        assert_eq!(removed, 0);
    }
}
