use std::collections::BTreeSet;

use hmac::{Hmac, Mac};
use issuefix_core::notify::{is_bot_actor, is_self_authored};
use issuefix_core::types::{Event, EventKind};
use serde::Deserialize;
use sha2::Sha256;

/// Result of mapping one GitHub delivery onto the pipeline's event model.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound {
    Event(Event),
    Ignored(String),
}

// ── Payload shapes (only the fields we read) ───────────────────────────────

#[derive(Debug, Deserialize)]
struct Payload {
    #[serde(default)]
    action: String,
    issue: Option<IssuePayload>,
    comment: Option<CommentPayload>,
    repository: Option<RepositoryPayload>,
    sender: Option<UserPayload>,
}

#[derive(Debug, Deserialize)]
struct IssuePayload {
    number: u64,
    #[serde(default)]
    title: String,
    body: Option<String>,
    #[serde(default)]
    labels: Vec<LabelPayload>,
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct CommentPayload {
    body: Option<String>,
    user: Option<UserPayload>,
}

#[derive(Debug, Deserialize)]
struct LabelPayload {
    name: String,
}

#[derive(Debug, Deserialize)]
struct RepositoryPayload {
    full_name: String,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    login: String,
}

// ── Signature ──────────────────────────────────────────────────────────────

/// Checks `X-Hub-Signature-256` (`sha256=<hex>`) against the raw body.
pub fn verify_signature(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_sig) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig.trim()) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

// ── Mapping ────────────────────────────────────────────────────────────────

pub fn to_event(
    event_type: &str,
    delivery_id: &str,
    body: &[u8],
    bot_login: &str,
) -> Result<Inbound, serde_json::Error> {
    if event_type != "issues" && event_type != "issue_comment" {
        return Ok(Inbound::Ignored(format!("unhandled event type {event_type:?}")));
    }

    let payload: Payload = serde_json::from_slice(body)?;
    let kind = match (event_type, payload.action.as_str()) {
        ("issues", "opened") => EventKind::IssueCreated,
        ("issues", "edited" | "labeled" | "reopened") => EventKind::IssueUpdated,
        ("issue_comment", "created") => EventKind::IssueComment,
        (_, action) => return Ok(Inbound::Ignored(format!("{event_type} action {action:?}"))),
    };

    let (Some(issue), Some(repository)) = (payload.issue, payload.repository) else {
        return Ok(Inbound::Ignored("payload has no issue or repository".into()));
    };
    if issue.pull_request.is_some() {
        return Ok(Inbound::Ignored("pull request activity".into()));
    }

    let actor = payload
        .comment
        .as_ref()
        .and_then(|c| c.user.as_ref())
        .or(payload.sender.as_ref())
        .map(|u| u.login.clone())
        .unwrap_or_default();
    if is_bot_actor(&actor, bot_login) {
        return Ok(Inbound::Ignored(format!("authored by bot {actor}")));
    }

    let mut raw_text = issue.body.unwrap_or_default();
    if kind == EventKind::IssueComment {
        let comment = payload.comment.and_then(|c| c.body).unwrap_or_default();
        if is_self_authored(&comment) {
            return Ok(Inbound::Ignored(format!("comment posted by this bot as {actor}")));
        }
        if !comment.is_empty() {
            if !raw_text.is_empty() {
                raw_text.push_str("\n\n");
            }
            raw_text.push_str(&comment);
        }
    }

    let labels: BTreeSet<String> = issue.labels.into_iter().map(|l| l.name).collect();

    Ok(Inbound::Event(Event {
        kind,
        repository: repository.full_name,
        issue_number: issue.number,
        actor,
        labels,
        title: issue.title,
        raw_text,
        delivery_id: delivery_id.to_string(),
    }))
}
