//! Fix agent adapter: bounded task description in, normalized [`ChangeSet`] out.
//!
//! Agent output is untrusted. Every deviation from the marker contract becomes
//! a failed ChangeSet with a descriptive message, never a partial one.

use std::collections::BTreeMap;
use std::path::{Component, Path};
use std::time::Duration;

use glob::{MatchOptions, Pattern};
use thiserror::Error;
use tracing::{info, warn};

use crate::agent::{AgentBackend, AgentOutput};
use crate::analyzer::truncate_to_boundary;
use crate::git::VersionControl;
use crate::types::{ChangeSet, FileChange, FixTask, RepositoryPolicy};

pub const DEFAULT_MAX_TASK_BYTES: usize = 16 * 1024;

pub const FILE_OPEN: &str = "<<<FILE ";
pub const MARKER_CLOSE: &str = ">>>";
pub const FILE_END: &str = "<<<END FILE>>>";
pub const CANNOT_FIX: &str = "<<<CANNOT FIX>>>";

const MAX_LISTED_PATHS: usize = 50;
const MAX_TITLE_BYTES: usize = 512;
const MAX_AGENT_NOTES: usize = 2000;

// ── Path filtering ───────────────────────────────────────────────────────

fn match_options() -> MatchOptions {
    MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    }
}

/// True when `path` matches an include glob and no exclude glob.
pub fn path_allowed(path: &str, policy: &RepositoryPolicy) -> bool {
    let opts = match_options();
    let matches = |globs: &[String]| {
        globs.iter().any(|g| {
            Pattern::new(g)
                .map(|p| p.matches_with(path, opts))
                .unwrap_or(false)
        })
    };
    matches(&policy.path_includes) && !matches(&policy.path_excludes)
}

pub fn filter_paths(paths: &[String], policy: &RepositoryPolicy) -> Vec<String> {
    paths
        .iter()
        .filter(|p| path_allowed(p, policy))
        .cloned()
        .collect()
}

/// Relative, non-empty, and free of `..` components.
pub fn is_safe_relative(path: &str) -> bool {
    !path.is_empty()
        && Path::new(path)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

// ── Task description ─────────────────────────────────────────────────────

/// Render the agent prompt. Title, body and error context share the byte
/// budget left after the fixed instructions; the output contract is always
/// included in full.
pub fn build_task_description(task: &FixTask, max_bytes: usize) -> String {
    let targets = filter_paths(&task.target_paths, &task.policy);

    let mut frame_tail = String::new();
    if !targets.is_empty() {
        frame_tail.push_str("\n## Files likely involved\n");
        for p in targets.iter().take(MAX_LISTED_PATHS) {
            frame_tail.push_str(&format!("- {p}\n"));
        }
    }
    frame_tail.push_str("\n## Constraints\n");
    frame_tail.push_str(&format!(
        "- Only modify files matching: {}\n",
        task.policy.path_includes.join(", ")
    ));
    if !task.policy.path_excludes.is_empty() {
        frame_tail.push_str(&format!(
            "- Never modify files matching: {}\n",
            task.policy.path_excludes.join(", ")
        ));
    }
    frame_tail.push_str("- Make the smallest change that fixes the issue.\n");
    frame_tail.push_str(&output_contract());

    let header = format!("Fix issue #{} in this repository.\n\n", task.issue_number);
    let fixed_len = header.len() + frame_tail.len() + 64;
    let mut budget = max_bytes.saturating_sub(fixed_len);

    let title = take_budget(&task.title, MAX_TITLE_BYTES.min(budget));
    budget = budget.saturating_sub(title.len());

    let errors = task.error_context.join("\n\n");
    let errors = take_budget(&errors, budget / 2);
    budget = budget.saturating_sub(errors.len());

    let body = take_budget(&task.body, budget);

    let mut s = header;
    s.push_str(&format!("## Title\n{title}\n"));
    if !body.trim().is_empty() {
        s.push_str(&format!("\n## Issue description\n{body}\n"));
    }
    if !errors.trim().is_empty() {
        s.push_str(&format!("\n## Error context\n{errors}\n"));
    }
    s.push_str(&frame_tail);
    s
}

fn take_budget(text: &str, budget: usize) -> String {
    const MARK: &str = "\n[truncated]";
    if text.len() <= budget {
        return text.to_string();
    }
    if budget <= MARK.len() {
        return String::new();
    }
    format!("{}{MARK}", truncate_to_boundary(text, budget - MARK.len()))
}

fn output_contract() -> String {
    format!(
        "\n## Output format\n\
         For every file you change, output its complete new content:\n\
         {FILE_OPEN}path/to/file{MARKER_CLOSE}\n\
         ...full new content...\n\
         {FILE_END}\n\
         Paths are relative to the repository root. A unified diff may be given \
         instead of full content.\n\
         If you cannot fix the issue, output a single line:\n\
         {CANNOT_FIX} reason\n"
    )
}

// ── Output parsing ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentReply {
    Files {
        files: BTreeMap<String, FileChange>,
        /// Text outside file blocks.
        notes: String,
    },
    CannotFix(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedOutput {
    #[error("file block for {0} is never closed")]
    Unclosed(String),
    #[error("file block for {inner} opened inside block for {outer}")]
    Nested { outer: String, inner: String },
    #[error("end-of-file marker without an open file block (line {0})")]
    StrayEnd(usize),
    #[error("file block with empty path (line {0})")]
    EmptyPath(usize),
    #[error("duplicate file block for {0}")]
    Duplicate(String),
}

fn open_marker_path(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix(FILE_OPEN)
        .and_then(|rest| rest.strip_suffix(MARKER_CLOSE))
        .map(str::trim)
}

/// Parse marker-delimited agent output. Zero file blocks is not an error
/// here; callers decide once on-disk changes have been read back.
pub fn parse_agent_output(raw: &str) -> Result<AgentReply, MalformedOutput> {
    let mut files = BTreeMap::new();
    let mut notes = Vec::new();
    let mut open: Option<(String, Vec<&str>)> = None;

    for (idx, line) in raw.lines().enumerate() {
        let lineno = idx + 1;
        let trimmed = line.trim();

        if let Some((path, body)) = open.as_mut() {
            if trimmed == FILE_END {
                let content = classify_content(body);
                let path = std::mem::take(path);
                if files.insert(path.clone(), content).is_some() {
                    return Err(MalformedOutput::Duplicate(path));
                }
                open = None;
            } else if let Some(inner) = open_marker_path(line) {
                return Err(MalformedOutput::Nested {
                    outer: path.clone(),
                    inner: inner.to_string(),
                });
            } else {
                body.push(line);
            }
            continue;
        }

        if let Some(reason) = trimmed.strip_prefix(CANNOT_FIX) {
            let reason = reason.trim();
            let reason = if reason.is_empty() {
                "agent declined without a reason".to_string()
            } else {
                reason.to_string()
            };
            return Ok(AgentReply::CannotFix(reason));
        }
        if trimmed == FILE_END {
            return Err(MalformedOutput::StrayEnd(lineno));
        }
        if let Some(path) = open_marker_path(line) {
            let path = path.trim_start_matches("./");
            if path.is_empty() {
                return Err(MalformedOutput::EmptyPath(lineno));
            }
            if files.contains_key(path) {
                return Err(MalformedOutput::Duplicate(path.to_string()));
            }
            open = Some((path.to_string(), Vec::new()));
            continue;
        }
        notes.push(line);
    }

    if let Some((path, _)) = open {
        return Err(MalformedOutput::Unclosed(path));
    }

    let notes = notes.join("\n");
    Ok(AgentReply::Files {
        files,
        notes: truncate_to_boundary(notes.trim(), MAX_AGENT_NOTES).to_string(),
    })
}

/// Strip one wrapping code fence, then decide between diff and full content.
fn classify_content(lines: &[&str]) -> FileChange {
    let mut slice = lines;
    if let (Some(first), Some(last)) = (slice.first(), slice.last()) {
        if slice.len() >= 2 && first.trim_start().starts_with("```") && last.trim() == "```" {
            slice = &slice[1..slice.len() - 1];
        }
    }
    let mut text = slice.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    let head = text.trim_start();
    if head.starts_with("--- ") || head.starts_with("diff --git") || head.starts_with("@@") {
        FileChange::Diff(text)
    } else {
        FileChange::Content(text)
    }
}

// ── Generation ───────────────────────────────────────────────────────────

pub struct Fixer<'a> {
    pub agent: &'a dyn AgentBackend,
    pub vcs: &'a dyn VersionControl,
    pub agent_timeout: Duration,
    pub max_task_bytes: usize,
}

impl Fixer<'_> {
    /// Run the agent for `task`. Never errors: failures come back as a
    /// ChangeSet with `success = false`.
    pub async fn generate(&self, task: &FixTask) -> ChangeSet {
        let description = build_task_description(task, self.max_task_bytes);
        info!(
            issue = task.issue_number,
            backend = self.agent.name(),
            bytes = description.len(),
            "invoking fix agent"
        );

        let targets = filter_paths(&task.target_paths, &task.policy);
        let raw = match self
            .agent
            .run_with_files(&description, &task.working_copy, &targets, self.agent_timeout)
            .await
        {
            Ok(AgentOutput::Completed(raw)) => raw,
            Ok(AgentOutput::TimedOut) => {
                warn!(issue = task.issue_number, timeout_s = self.agent_timeout.as_secs(), "agent timed out");
                return ChangeSet::failed(format!(
                    "timeout: agent did not finish within {}s",
                    self.agent_timeout.as_secs()
                ));
            }
            Err(e) => {
                warn!(issue = task.issue_number, "agent invocation failed: {e:#}");
                return ChangeSet::failed(format!("agent invocation failed: {e:#}"));
            }
        };

        let (mut files, notes) = match parse_agent_output(&raw) {
            Ok(AgentReply::CannotFix(reason)) => {
                info!(issue = task.issue_number, "agent declined: {reason}");
                return ChangeSet::failed(reason);
            }
            Ok(AgentReply::Files { files, notes }) => (files, notes),
            Err(e) => {
                warn!(issue = task.issue_number, "malformed agent output: {e}");
                return ChangeSet::failed(format!("malformed agent output: {e}"));
            }
        };

        self.read_back(task, &mut files).await;

        files.retain(|path, _| {
            let keep = is_safe_relative(path) && path_allowed(path, &task.policy);
            if !keep {
                warn!(issue = task.issue_number, path = %path, "dropping change outside allowed paths");
            }
            keep
        });

        if files.is_empty() {
            return ChangeSet::failed("agent produced no file changes within the allowed paths");
        }

        ChangeSet {
            files,
            success: true,
            agent_message: notes,
        }
    }

    /// Add files the agent edited in place but did not declare.
    async fn read_back(&self, task: &FixTask, files: &mut BTreeMap<String, FileChange>) {
        let changed = match self.vcs.changed_files(&task.working_copy).await {
            Ok(c) => c,
            Err(e) => {
                warn!(issue = task.issue_number, "could not list changed files: {e:#}");
                return;
            }
        };
        for path in changed {
            if files.contains_key(&path) || !is_safe_relative(&path) {
                continue;
            }
            match tokio::fs::read_to_string(task.working_copy.join(&path)).await {
                Ok(content) => {
                    files.insert(path, FileChange::Content(content));
                }
                Err(e) => warn!(issue = task.issue_number, path = %path, "skipping unreadable file: {e}"),
            }
        }
    }
}
