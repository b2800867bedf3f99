//! Working-copy preparation: one fresh clone and fix branch per run.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::git::VersionControl;
use crate::platform::PlatformApi;

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("clone failed: {0}")]
    CloneFailed(String),
    #[error("branch {branch} is already used by open change request #{number}")]
    BranchExists { branch: String, number: u64 },
    #[error("checkout failed: {0}")]
    CheckoutFailed(String),
}

/// A prepared local clone with the fix branch checked out.
#[derive(Debug, Clone)]
pub struct WorkingCopy {
    pub path: PathBuf,
    pub branch: String,
    pub base_ref: String,
    /// The branch already existed on the remote and will be overwritten.
    pub reused_branch: bool,
}

impl WorkingCopy {
    /// Remove the clone. Best effort.
    pub async fn cleanup(&self) {
        if let Err(e) = tokio::fs::remove_dir_all(&self.path).await {
            warn!(path = %self.path.display(), "failed to remove working copy: {e}");
        }
    }
}

/// `fix/issue-<n>`.
pub fn branch_name_for(issue_number: u64) -> String {
    sanitize_branch(&format!("fix/issue-{issue_number}"))
}

/// Replace anything outside `[A-Za-z0-9/_-]` with `-`.
pub fn sanitize_branch(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// `<root>/<owner>-<repo>/run-<run_id>`.
pub fn run_dir(workspace_root: &Path, repository: &str, run_id: &str) -> PathBuf {
    workspace_root
        .join(sanitize_branch(&repository.replace('/', "-")))
        .join(format!("run-{run_id}"))
}

pub struct Preparer<'a> {
    pub vcs: &'a dyn VersionControl,
    pub platform: &'a dyn PlatformApi,
    pub workspace_root: &'a Path,
}

impl Preparer<'_> {
    pub async fn prepare(
        &self,
        repository: &str,
        base_ref: &str,
        branch: &str,
        run_id: &str,
    ) -> Result<WorkingCopy, PrepareError> {
        let dest = run_dir(self.workspace_root, repository, run_id);
        let url = self.platform.clone_url(repository);

        if let Err(e) = self.vcs.clone_repo(&url, base_ref, &dest).await {
            discard(&dest).await;
            return Err(PrepareError::CloneFailed(format!("{e:#}")));
        }

        let wc = WorkingCopy {
            path: dest,
            branch: branch.to_string(),
            base_ref: base_ref.to_string(),
            reused_branch: false,
        };
        match self.checkout_fix_branch(repository, wc.clone()).await {
            Ok(wc) => Ok(wc),
            Err(e) => {
                wc.cleanup().await;
                Err(e)
            }
        }
    }

    async fn checkout_fix_branch(
        &self,
        repository: &str,
        mut wc: WorkingCopy,
    ) -> Result<WorkingCopy, PrepareError> {
        let exists = self
            .vcs
            .remote_branch_exists(&wc.path, &wc.branch)
            .await
            .map_err(|e| PrepareError::CheckoutFailed(format!("{e:#}")))?;

        if exists {
            let open = self
                .platform
                .find_open_change_request(repository, &wc.branch)
                .await
                .map_err(|e| {
                    PrepareError::CheckoutFailed(format!("could not check open change requests: {e}"))
                })?;
            if let Some(cr) = open {
                return Err(PrepareError::BranchExists {
                    branch: wc.branch.clone(),
                    number: cr.number,
                });
            }
            info!(repo = repository, branch = %wc.branch, "reusing stale remote branch");
            wc.reused_branch = true;
        }

        self.vcs
            .create_branch(&wc.path, &wc.branch, &wc.base_ref)
            .await
            .map_err(|e| PrepareError::CheckoutFailed(format!("{e:#}")))?;
        Ok(wc)
    }
}

async fn discard(path: &Path) {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        let _ = tokio::fs::remove_dir_all(path).await;
    }
}
