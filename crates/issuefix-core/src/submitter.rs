//! Change submitter: commit, push, open the change request, link it back.
//!
//! Steps run strictly in order and stop at the first failure. Nothing is
//! rolled back; a pushed branch without a request is left for inspection.

use thiserror::Error;
use tracing::info;

use crate::git::{CommitAuthor, VersionControl};
use crate::notify::Notifier;
use crate::platform::{ChangeRequestSpec, PlatformApi};
use crate::types::{ChangeRequestRef, ChangeSet, IssueAnalysis, RepositoryPolicy};
use crate::workspace::WorkingCopy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStep {
    Commit,
    Push,
    Submit,
    Link,
}

impl std::fmt::Display for SubmitStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Commit => "commit",
            Self::Push => "push",
            Self::Submit => "submit",
            Self::Link => "link",
        })
    }
}

#[derive(Debug, Error)]
#[error("{step} step failed: {detail}")]
pub struct SubmitError {
    pub step: SubmitStep,
    pub detail: String,
    /// Set when the request was opened before the failure (link step).
    pub change_request: Option<ChangeRequestRef>,
}

impl SubmitError {
    fn at(step: SubmitStep, detail: impl Into<String>) -> Self {
        Self {
            step,
            detail: detail.into(),
            change_request: None,
        }
    }
}

pub struct SubmitContext<'a> {
    pub repository: &'a str,
    pub issue_number: u64,
    pub title: &'a str,
    pub analysis: &'a IssueAnalysis,
    pub policy: &'a RepositoryPolicy,
    pub author: &'a CommitAuthor,
    pub notifier: &'a Notifier<'a>,
}

pub struct Submitter<'a> {
    pub vcs: &'a dyn VersionControl,
    pub platform: &'a dyn PlatformApi,
}

impl Submitter<'_> {
    pub async fn submit(
        &self,
        wc: &WorkingCopy,
        change_set: ChangeSet,
        ctx: &SubmitContext<'_>,
    ) -> Result<ChangeRequestRef, SubmitError> {
        if !change_set.is_submittable() {
            return Err(SubmitError::at(
                SubmitStep::Commit,
                "change set is unsuccessful or empty",
            ));
        }

        let message = request_title(ctx.issue_number, ctx.title);
        let sha = self
            .vcs
            .write_and_commit(&wc.path, &change_set.files, &message, ctx.author)
            .await
            .map_err(|e| SubmitError::at(SubmitStep::Commit, format!("{e:#}")))?;
        info!(repo = ctx.repository, issue = ctx.issue_number, sha = %sha, "committed fix");

        self.vcs
            .push(&wc.path, &wc.branch)
            .await
            .map_err(|e| SubmitError::at(SubmitStep::Push, format!("{e:#}")))?;
        info!(repo = ctx.repository, branch = %wc.branch, "pushed fix branch");

        let spec = ChangeRequestSpec {
            title: message,
            body: request_body(ctx, &change_set),
            head: wc.branch.clone(),
            base: wc.base_ref.clone(),
            draft: ctx.policy.draft,
            reviewers: ctx.policy.reviewers.iter().cloned().collect(),
            labels: ctx.policy.pr_labels.iter().cloned().collect(),
        };
        let request = self
            .platform
            .create_change_request(ctx.repository, &spec)
            .await
            .map_err(|e| SubmitError::at(SubmitStep::Submit, e.to_string()))?;
        info!(repo = ctx.repository, number = request.number, url = %request.url, "opened change request");

        match ctx.notifier.notify(&link_comment(&request)).await {
            Ok(_) => Ok(request),
            Err(e) => Err(SubmitError {
                step: SubmitStep::Link,
                detail: e.to_string(),
                change_request: Some(request),
            }),
        }
    }
}

/// Commit message and request title.
pub fn request_title(issue_number: u64, title: &str) -> String {
    let title = title.trim();
    if title.is_empty() {
        format!("Fix issue #{issue_number}")
    } else {
        format!("Fix issue #{issue_number}: {title}")
    }
}

fn request_body(ctx: &SubmitContext<'_>, change_set: &ChangeSet) -> String {
    let mut s = format!(
        "Automated fix for #{}.\n\n## Analysis\n\n{}",
        ctx.issue_number,
        ctx.analysis.summary()
    );
    s.push_str("\n## Changed files\n\n");
    for path in change_set.paths() {
        s.push_str(&format!("- `{path}`\n"));
    }
    if !change_set.agent_message.trim().is_empty() {
        s.push_str("\n## Agent notes\n\n");
        s.push_str(change_set.agent_message.trim());
        s.push('\n');
    }
    s.push_str("\nPlease review carefully before merging.\n\n");
    s.push_str(&format!("Closes #{}\n", ctx.issue_number));
    s
}

fn link_comment(request: &ChangeRequestRef) -> String {
    format!(
        "I've opened #{} ({}) with a proposed fix for this issue. Please review it before merging.",
        request.number, request.url
    )
}
