//! Per-repository policy: fetch `.github/issuefix.yml` and fall back to
//! defaults leaf by leaf.

use std::collections::BTreeSet;

use serde_yaml::Value;
use tracing::{info, warn};

use crate::platform::{ApiError, PlatformApi};
use crate::types::RepositoryPolicy;

pub const POLICY_PATH: &str = ".github/issuefix.yml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub policy: RepositoryPolicy,
    /// True when the whole document was unavailable or unparsable.
    pub used_defaults: bool,
}

/// Fetch and parse the repository policy. Never fails: any problem yields
/// the built-in defaults.
pub async fn resolve(platform: &dyn PlatformApi, repo: &str, path: &str) -> ResolvedPolicy {
    let defaults = ResolvedPolicy {
        policy: RepositoryPolicy::default(),
        used_defaults: true,
    };

    let bytes = match platform.fetch_file(repo, path).await {
        Ok(b) => b,
        Err(ApiError::NotFound) => {
            info!(repo, path, "no policy file; using defaults");
            return defaults;
        }
        Err(e) => {
            warn!(repo, path, "failed to fetch policy: {e}; using defaults");
            return defaults;
        }
    };

    let text = String::from_utf8_lossy(&bytes);
    match parse_policy(&text) {
        Ok(policy) => ResolvedPolicy {
            policy,
            used_defaults: false,
        },
        Err(e) => {
            warn!(repo, path, "invalid policy document: {e}; using defaults");
            defaults
        }
    }
}

/// Parse a policy document. Only a top-level YAML error (or a non-mapping
/// document) is an error; bad leaves silently revert to their defaults.
pub fn parse_policy(text: &str) -> Result<RepositoryPolicy, serde_yaml::Error> {
    let doc: Value = serde_yaml::from_str(text)?;
    let mut policy = RepositoryPolicy::default();

    let Value::Mapping(_) = doc else {
        // Empty file parses as Null: treat it as "all defaults".
        if doc.is_null() {
            return Ok(policy);
        }
        return serde_yaml::from_str::<serde_yaml::Mapping>(text).map(|_| policy);
    };

    if let Some(labels) = section(&doc, "labels") {
        if let Some(v) = string_set(labels.get("process")) {
            policy.process_labels = v;
        }
        if let Some(v) = string_set(labels.get("ignore")) {
            policy.ignore_labels = v;
        }
    }

    if let Some(files) = section(&doc, "files") {
        if let Some(v) = glob_list(files.get("include")) {
            policy.path_includes = v;
        }
        if let Some(v) = glob_list(files.get("exclude")) {
            policy.path_excludes = v;
        }
    }

    if let Some(pr) = section(&doc, "pr") {
        if let Some(v) = string_set(pr.get("reviewers")) {
            policy.reviewers = v;
        }
        if let Some(Value::Bool(b)) = pr.get("draft") {
            policy.draft = *b;
        }
        if let Some(v) = string_set(pr.get("labels")) {
            policy.pr_labels = v;
        }
    }

    Ok(policy)
}

fn section<'a>(doc: &'a Value, key: &str) -> Option<&'a Value> {
    doc.get(key).filter(|v| v.is_mapping())
}

/// A sequence of strings. Any non-string element invalidates the leaf.
fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    let seq = value?.as_sequence()?;
    seq.iter()
        .map(|item| item.as_str().map(|s| s.trim().to_string()))
        .collect()
}

fn string_set(value: Option<&Value>) -> Option<BTreeSet<String>> {
    string_list(value).map(|v| v.into_iter().filter(|s| !s.is_empty()).collect())
}

fn glob_list(value: Option<&Value>) -> Option<Vec<String>> {
    let globs = string_list(value)?;
    if globs.iter().all(|g| glob::Pattern::new(g).is_ok()) {
        Some(globs)
    } else {
        None
    }
}
