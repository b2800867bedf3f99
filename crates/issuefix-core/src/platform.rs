use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use crate::retry::{with_retry, IsTransient, RetryPolicy};
use crate::types::ChangeRequestRef;

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("{operation} failed with status {status}: {body}")]
    Status {
        operation: String,
        status: u16,
        body: String,
        /// 403 responses that carry exhausted rate-limit headers.
        rate_limited: bool,
        retry_after: Option<Duration>,
    },
    #[error("{operation} request failed: {detail}")]
    Transport {
        operation: String,
        detail: String,
        transient: bool,
    },
    #[error("{operation}: unexpected response: {detail}")]
    Decode { operation: String, detail: String },
}

impl IsTransient for ApiError {
    fn is_transient(&self) -> bool {
        match self {
            ApiError::Status {
                status,
                rate_limited,
                ..
            } => *status == 429 || *status >= 500 || (*status == 403 && *rate_limited),
            ApiError::Transport { transient, .. } => *transient,
            ApiError::NotFound | ApiError::Decode { .. } => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Everything needed to open one change-review request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRequestSpec {
    pub title: String,
    pub body: String,
    /// Source branch.
    pub head: String,
    /// Target branch.
    pub base: String,
    pub draft: bool,
    pub reviewers: Vec<String>,
    pub labels: Vec<String>,
}

/// Hosting-platform operations the pipeline needs. `repo` is `owner/name`.
#[async_trait]
pub trait PlatformApi: Send + Sync {
    /// Raw file bytes at the default branch head. `ApiError::NotFound` when absent.
    async fn fetch_file(&self, repo: &str, path: &str) -> Result<Vec<u8>, ApiError>;

    async fn post_comment(&self, repo: &str, issue_number: u64, body: &str) -> Result<(), ApiError>;

    async fn create_change_request(
        &self,
        repo: &str,
        spec: &ChangeRequestSpec,
    ) -> Result<ChangeRequestRef, ApiError>;

    async fn find_open_change_request(
        &self,
        repo: &str,
        branch: &str,
    ) -> Result<Option<ChangeRequestRef>, ApiError>;

    async fn default_branch(&self, repo: &str) -> Result<String, ApiError>;

    /// Authenticated clone URL. Never log this value.
    fn clone_url(&self, repo: &str) -> String;
}

/// Wraps a platform so every call is retried on transient errors.
pub struct RetryingPlatform {
    inner: Arc<dyn PlatformApi>,
    policy: RetryPolicy,
}

impl RetryingPlatform {
    pub fn new(inner: Arc<dyn PlatformApi>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl PlatformApi for RetryingPlatform {
    async fn fetch_file(&self, repo: &str, path: &str) -> Result<Vec<u8>, ApiError> {
        with_retry(&self.policy, "fetch_file", || self.inner.fetch_file(repo, path)).await
    }

    async fn post_comment(&self, repo: &str, issue_number: u64, body: &str) -> Result<(), ApiError> {
        with_retry(&self.policy, "post_comment", || {
            self.inner.post_comment(repo, issue_number, body)
        })
        .await
    }

    /// A failed create may still have landed server-side, so every retry
    /// first looks for an open request on the same head branch.
    async fn create_change_request(
        &self,
        repo: &str,
        spec: &ChangeRequestSpec,
    ) -> Result<ChangeRequestRef, ApiError> {
        let attempted = &AtomicBool::new(false);
        let inner = &self.inner;
        with_retry(&self.policy, "create_change_request", || async move {
            if attempted.swap(true, Ordering::SeqCst) {
                if let Ok(Some(existing)) = inner.find_open_change_request(repo, &spec.head).await {
                    info!(repo, head = %spec.head, number = existing.number, "change request already exists");
                    return Ok(existing);
                }
            }
            inner.create_change_request(repo, spec).await
        })
        .await
    }

    async fn find_open_change_request(
        &self,
        repo: &str,
        branch: &str,
    ) -> Result<Option<ChangeRequestRef>, ApiError> {
        with_retry(&self.policy, "find_open_change_request", || {
            self.inner.find_open_change_request(repo, branch)
        })
        .await
    }

    async fn default_branch(&self, repo: &str) -> Result<String, ApiError> {
        with_retry(&self.policy, "default_branch", || self.inner.default_branch(repo)).await
    }

    fn clone_url(&self, repo: &str) -> String {
        self.inner.clone_url(repo)
    }
}
