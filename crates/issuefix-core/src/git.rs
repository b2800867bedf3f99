use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::types::FileChange;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

/// Version-control operations on a local working copy.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Clone `url` into `dest` (which must not exist) with `base_ref` checked out.
    async fn clone_repo(&self, url: &str, base_ref: &str, dest: &Path) -> Result<()>;

    async fn remote_branch_exists(&self, dir: &Path, branch: &str) -> Result<bool>;

    /// Create (or reset) `branch` at `origin/<base_ref>` and check it out.
    async fn create_branch(&self, dir: &Path, branch: &str, base_ref: &str) -> Result<()>;

    /// Paths modified, added or untracked relative to HEAD.
    async fn changed_files(&self, dir: &Path) -> Result<Vec<String>>;

    /// Write full-content files, apply diff fragments, stage exactly these
    /// paths and commit. Returns the new commit sha.
    async fn write_and_commit(
        &self,
        dir: &Path,
        changes: &BTreeMap<String, FileChange>,
        message: &str,
        author: &CommitAuthor,
    ) -> Result<String>;

    /// Force-push `branch` to origin.
    async fn push(&self, dir: &Path, branch: &str) -> Result<()>;
}

/// [`VersionControl`] backed by the `git` CLI.
#[derive(Debug, Clone, Default)]
pub struct GitCli;

impl GitCli {
    pub fn new() -> Self {
        Self
    }

    pub async fn exec(&self, dir: &Path, args: &[&str]) -> Result<ExecResult> {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(dir);
        cmd.args(args);
        cmd.env("GIT_TERMINAL_PROMPT", "0");

        let output = cmd
            .output()
            .await
            .with_context(|| format!("failed to spawn git -C {} {}", dir.display(), redact(args)))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    async fn exec_ok(&self, dir: &Path, args: &[&str]) -> Result<ExecResult> {
        let result = self.exec(dir, args).await?;
        if !result.success() {
            return Err(anyhow!(
                "git {} failed in {}: {}",
                redact(args),
                dir.display(),
                result.combined_output().trim()
            ));
        }
        Ok(result)
    }

    pub async fn set_author_config(&self, dir: &Path, author: &CommitAuthor) -> Result<()> {
        self.exec_ok(dir, &["config", "user.name", &author.name]).await?;
        self.exec_ok(dir, &["config", "user.email", &author.email]).await?;
        Ok(())
    }

    pub async fn rev_parse_head(&self, dir: &Path) -> Result<String> {
        let result = self.exec_ok(dir, &["rev-parse", "HEAD"]).await?;
        Ok(result.stdout.trim().to_string())
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn clone_repo(&self, url: &str, base_ref: &str, dest: &Path) -> Result<()> {
        let parent = dest
            .parent()
            .ok_or_else(|| anyhow!("clone destination has no parent: {}", dest.display()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
        let dest_str = dest.to_string_lossy();
        self.exec_ok(
            parent,
            &["clone", "--branch", base_ref, "--single-branch", url, &dest_str],
        )
        .await?;
        Ok(())
    }

    async fn remote_branch_exists(&self, dir: &Path, branch: &str) -> Result<bool> {
        let result = self
            .exec(dir, &["ls-remote", "--exit-code", "--heads", "origin", branch])
            .await?;
        match result.exit_code {
            0 => Ok(true),
            2 => Ok(false),
            _ => bail!(
                "git ls-remote for {branch} failed: {}",
                result.combined_output().trim()
            ),
        }
    }

    async fn create_branch(&self, dir: &Path, branch: &str, base_ref: &str) -> Result<()> {
        let start = format!("origin/{base_ref}");
        self.exec_ok(dir, &["checkout", "-B", branch, &start]).await?;
        Ok(())
    }

    async fn changed_files(&self, dir: &Path) -> Result<Vec<String>> {
        let result = self
            .exec_ok(dir, &["status", "--porcelain", "--untracked-files=all"])
            .await?;
        Ok(parse_porcelain(&result.stdout))
    }

    async fn write_and_commit(
        &self,
        dir: &Path,
        changes: &BTreeMap<String, FileChange>,
        message: &str,
        author: &CommitAuthor,
    ) -> Result<String> {
        for (index, (path, change)) in changes.iter().enumerate() {
            let target = safe_join(dir, path)?;
            match change {
                FileChange::Content(content) => {
                    if let Some(parent) = target.parent() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                    tokio::fs::write(&target, content)
                        .await
                        .with_context(|| format!("failed to write {path}"))?;
                }
                FileChange::Diff(patch) => {
                    let patch_file = dir.join(".git").join(format!("issuefix-{index}.patch"));
                    let mut body = patch.clone();
                    if !body.ends_with('\n') {
                        body.push('\n');
                    }
                    tokio::fs::write(&patch_file, body).await?;
                    let patch_str = patch_file.to_string_lossy();
                    let applied = self
                        .exec(dir, &["apply", "--whitespace=nowarn", &patch_str])
                        .await;
                    let _ = tokio::fs::remove_file(&patch_file).await;
                    let applied = applied?;
                    if !applied.success() {
                        bail!(
                            "git apply failed for {path}: {}",
                            applied.combined_output().trim()
                        );
                    }
                }
            }
        }

        let mut add_args = vec!["add", "--"];
        add_args.extend(changes.keys().map(String::as_str));
        self.exec_ok(dir, &add_args).await?;

        let staged = self.exec(dir, &["diff", "--cached", "--quiet"]).await?;
        if staged.success() {
            bail!("nothing to commit: changes are identical to the base");
        }

        self.set_author_config(dir, author).await?;
        let author_str = format!("{} <{}>", author.name, author.email);
        self.exec_ok(dir, &["commit", "-m", message, "--author", &author_str])
            .await?;
        let sha = self.rev_parse_head(dir).await?;
        debug!(dir = %dir.display(), sha = %sha, "committed changes");
        Ok(sha)
    }

    async fn push(&self, dir: &Path, branch: &str) -> Result<()> {
        self.exec_ok(dir, &["push", "--force", "origin", branch]).await?;
        Ok(())
    }
}

/// Join a repository-relative path onto `dir`, refusing absolute paths and `..`.
pub fn safe_join(dir: &Path, relative: &str) -> Result<PathBuf> {
    let rel = Path::new(relative);
    if relative.is_empty()
        || !rel
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        bail!("unsafe path outside working copy: {relative:?}");
    }
    Ok(dir.join(rel))
}

/// Paths from `git status --porcelain` output. Renames yield the new path.
pub fn parse_porcelain(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|line| line.len() > 3)
        .filter(|line| !line.starts_with(" D") && !line.starts_with("D "))
        .map(|line| {
            let path = &line[3..];
            let path = path.rsplit_once(" -> ").map_or(path, |(_, new)| new);
            path.trim_matches('"').to_string()
        })
        .collect()
}

/// Hide credentials embedded in clone URLs before they reach logs or errors.
fn redact(args: &[&str]) -> String {
    args.iter()
        .map(|a| match (a.find("://"), a.find('@')) {
            (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &a[..scheme], &a[at..]),
            _ => (*a).to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
