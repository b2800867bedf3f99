use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Inbound Event ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IssueCreated,
    IssueUpdated,
    IssueComment,
}

/// One repository notification, immutable once received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// `owner/name` on the hosting platform.
    pub repository: String,
    pub issue_number: u64,
    pub actor: String,
    pub labels: BTreeSet<String>,
    pub title: String,
    /// Issue body, plus the comment body for `IssueComment` events.
    pub raw_text: String,
    /// Platform delivery id, used to drop repeated deliveries.
    pub delivery_id: String,
}

impl Event {
    pub fn issue_key(&self) -> IssueKey {
        IssueKey {
            repository: self.repository.clone(),
            issue_number: self.issue_number,
        }
    }

    /// True when both events would drive an identical run.
    pub fn same_content(&self, other: &Event) -> bool {
        self.kind == other.kind
            && self.labels == other.labels
            && self.title == other.title
            && self.raw_text == other.raw_text
    }
}

/// Lock-table key: at most one in-flight run per issue.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IssueKey {
    pub repository: String,
    pub issue_number: u64,
}

impl std::fmt::Display for IssueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repository, self.issue_number)
    }
}

// ── Repository Policy ────────────────────────────────────────────────────

/// Per-repository policy read from `.github/issuefix.yml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryPolicy {
    pub process_labels: BTreeSet<String>,
    pub ignore_labels: BTreeSet<String>,
    /// Glob patterns, evaluated in order.
    pub path_includes: Vec<String>,
    pub path_excludes: Vec<String>,
    pub reviewers: BTreeSet<String>,
    pub draft: bool,
    pub pr_labels: BTreeSet<String>,
}

impl Default for RepositoryPolicy {
    fn default() -> Self {
        Self {
            process_labels: ["bug", "fix-me"].into_iter().map(String::from).collect(),
            ignore_labels: ["discussion", "wontfix"].into_iter().map(String::from).collect(),
            path_includes: vec!["**".into()],
            path_excludes: Vec::new(),
            reviewers: BTreeSet::new(),
            draft: false,
            pr_labels: BTreeSet::new(),
        }
    }
}

// ── Issue Analysis ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueCategory {
    Bug,
    Feature,
    Question,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FixPotential {
    None,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for IssueCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Bug => "bug",
            Self::Feature => "feature",
            Self::Question => "question",
            Self::Other => "other",
        })
    }
}

impl std::fmt::Display for FixPotential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        })
    }
}

/// Structured signal derived from an issue's raw text.
///
/// `is_fixable` implies `category == Bug` and `fix_potential != None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueAnalysis {
    /// Deduplicated, first-seen order.
    pub file_paths: Vec<String>,
    pub error_excerpts: Vec<String>,
    pub code_blocks: Vec<String>,
    pub category: IssueCategory,
    pub fix_potential: FixPotential,
    pub is_fixable: bool,
}

impl IssueAnalysis {
    /// Short human-readable rendering used in comments and request bodies.
    pub fn summary(&self) -> String {
        let mut s = format!("Issue type: {}\n", self.category);
        if !self.file_paths.is_empty() {
            s.push_str(&format!("Affected files: {}\n", self.file_paths.join(", ")));
        }
        if !self.error_excerpts.is_empty() {
            s.push_str(&format!("Error messages found: {}\n", self.error_excerpts.len()));
        }
        if !self.code_blocks.is_empty() {
            s.push_str(&format!("Code blocks found: {}\n", self.code_blocks.len()));
        }
        s.push_str(&format!("Fix potential: {}\n", self.fix_potential));
        s
    }
}

// ── Fix Task / Change Set ────────────────────────────────────────────────

/// Read-only input to the fix agent adapter, built once per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixTask {
    pub working_copy: PathBuf,
    pub branch: String,
    pub issue_number: u64,
    pub title: String,
    pub body: String,
    pub target_paths: Vec<String>,
    pub error_context: Vec<String>,
    pub policy: RepositoryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum FileChange {
    /// Complete replacement content for the file.
    Content(String),
    /// Unified diff fragment to apply against the working copy.
    Diff(String),
}

/// Normalized agent result. Consumed by the submitter, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub files: BTreeMap<String, FileChange>,
    pub success: bool,
    pub agent_message: String,
}

impl ChangeSet {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            files: BTreeMap::new(),
            success: false,
            agent_message: message.into(),
        }
    }

    pub fn is_submittable(&self) -> bool {
        self.success && !self.files.is_empty()
    }

    pub fn paths(&self) -> Vec<&str> {
        self.files.keys().map(String::as_str).collect()
    }
}

/// Reference to an opened change-review request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequestRef {
    pub number: u64,
    pub url: String,
}

// ── Pipeline Run ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Received,
    Filtered,
    Analyzed,
    Prepared,
    Generated,
    Submitted,
    Ignored,
    Rejected,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Submitted | Self::Ignored | Self::Rejected | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Filtered => "filtered",
            Self::Analyzed => "analyzed",
            Self::Prepared => "prepared",
            Self::Generated => "generated",
            Self::Submitted => "submitted",
            Self::Ignored => "ignored",
            Self::Rejected => "rejected",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Submitted,
    RejectedUnfixable,
    RejectedIgnored,
    Failed,
}

/// Per-event state owned by one orchestrator invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: String,
    pub event: Event,
    pub policy: Option<RepositoryPolicy>,
    pub used_default_policy: bool,
    pub analysis: Option<IssueAnalysis>,
    pub branch: Option<String>,
    pub change_set: Option<ChangeSet>,
    pub change_request: Option<ChangeRequestRef>,
    pub state: RunState,
    /// Every state the run passed through, in order.
    pub trail: Vec<RunState>,
    pub outcome: Option<RunOutcome>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    pub fn new(event: Event) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            event,
            policy: None,
            used_default_policy: false,
            analysis: None,
            branch: None,
            change_set: None,
            change_request: None,
            state: RunState::Received,
            trail: vec![RunState::Received],
            outcome: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn advance(&mut self, state: RunState) {
        self.state = state;
        self.trail.push(state);
    }

    /// Move to a terminal state and record the outcome.
    pub fn finish(&mut self, state: RunState, outcome: RunOutcome, error: Option<String>) {
        self.advance(state);
        self.outcome = Some(outcome);
        self.error = error;
        self.finished_at = Some(Utc::now());
    }
}

// ── Pipeline Events ──────────────────────────────────────────────────────

/// Broadcast after each run state change.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Transition {
        run_id: String,
        issue: IssueKey,
        state: RunState,
    },
    Finished {
        run_id: String,
        issue: IssueKey,
        outcome: RunOutcome,
        message: String,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::Transition { .. } => "run_transition",
            Self::Finished { .. } => "run_finished",
        }
    }

    pub fn run_id(&self) -> &str {
        match self {
            Self::Transition { run_id, .. } | Self::Finished { run_id, .. } => run_id,
        }
    }
}
