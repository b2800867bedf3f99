use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::platform::{ApiError, PlatformApi};

/// Hidden trailer on every comment the pipeline posts. Comment events that
/// carry it are the bot hearing itself and never start a run.
pub const SELF_MARKER: &str = "<!-- issuefix:bot -->";

pub fn is_self_authored(text: &str) -> bool {
    text.contains(SELF_MARKER)
}

/// True for the bot's own account and for GitHub App actors.
pub fn is_bot_actor(actor: &str, bot_login: &str) -> bool {
    (!bot_login.is_empty() && actor.eq_ignore_ascii_case(bot_login)) || actor.ends_with("[bot]")
}

/// At most one issue comment per run.
///
/// The slot is consumed before the comment is posted, so a failed post also
/// counts: a run never tries a second, different notification afterwards.
pub struct Notifier<'a> {
    platform: &'a dyn PlatformApi,
    repo: &'a str,
    issue_number: u64,
    used: AtomicBool,
}

impl<'a> Notifier<'a> {
    pub fn new(platform: &'a dyn PlatformApi, repo: &'a str, issue_number: u64) -> Self {
        Self {
            platform,
            repo,
            issue_number,
            used: AtomicBool::new(false),
        }
    }

    /// Post `body` unless this run already notified. Returns whether a post
    /// was attempted and succeeded.
    pub async fn notify(&self, body: &str) -> Result<bool, ApiError> {
        if self.used.swap(true, Ordering::SeqCst) {
            info!(repo = self.repo, issue = self.issue_number, "notification already sent; skipping");
            return Ok(false);
        }
        let body = format!("{body}\n\n{SELF_MARKER}");
        self.platform
            .post_comment(self.repo, self.issue_number, &body)
            .await
            .map(|()| true)
    }

    /// Like [`Notifier::notify`] but only logs failures.
    pub async fn notify_best_effort(&self, body: &str) {
        if let Err(e) = self.notify(body).await {
            warn!(repo = self.repo, issue = self.issue_number, "failed to post comment: {e}");
        }
    }

    /// Consume the slot without posting.
    pub fn suppress(&self) {
        self.used.store(true, Ordering::SeqCst);
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::SeqCst)
    }
}
