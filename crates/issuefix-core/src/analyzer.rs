//! Fixability analysis: raw issue text → [`IssueAnalysis`].
//!
//! Pure and deterministic. Malformed or empty input never errors; it simply
//! yields `category = Other` and `is_fixable = false`.

use std::collections::HashSet;
use std::sync::OnceLock;

use regex::Regex;

use crate::types::{FixPotential, IssueAnalysis, IssueCategory};

/// Issue text beyond this many bytes is ignored.
pub const DEFAULT_MAX_ISSUE_BYTES: usize = 64 * 1024;

const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "pyi", "js", "mjs", "cjs", "ts", "tsx", "jsx", "go", "java", "kt", "kts", "c",
    "h", "cc", "cpp", "cxx", "hpp", "cs", "rb", "php", "swift", "scala", "sh", "bash", "zsh",
    "yml", "yaml", "toml", "json", "md", "html", "htm", "css", "scss", "vue", "svelte", "sql",
    "lua", "ex", "exs", "erl", "hs", "ml", "dart", "r", "m", "mm", "pl", "cfg", "ini", "xml",
    "gradle", "proto", "tf", "txt", "lock",
];

const BUG_TERMS: &[&str] = &["bug", "error", "crash", "exception", "fail", "broken", "traceback"];
const FEATURE_TERMS: &[&str] = &["add", "support", "please implement", "feature", "enhancement"];
const QUESTION_TERMS: &[&str] = &["how", "why"];

const BUG_WEIGHT: u32 = 3;
const FEATURE_WEIGHT: u32 = 2;
const QUESTION_WEIGHT: u32 = 1;

pub fn analyze(raw_text: &str) -> IssueAnalysis {
    analyze_bounded(raw_text, DEFAULT_MAX_ISSUE_BYTES)
}

/// Same as [`analyze`] with an explicit input cap, applied before scanning.
pub fn analyze_bounded(raw_text: &str, max_bytes: usize) -> IssueAnalysis {
    let text = truncate_to_boundary(raw_text, max_bytes);
    if text.trim().is_empty() {
        return IssueAnalysis {
            file_paths: Vec::new(),
            error_excerpts: Vec::new(),
            code_blocks: Vec::new(),
            category: IssueCategory::Other,
            fix_potential: FixPotential::None,
            is_fixable: false,
        };
    }

    let segments = split_fences(text);

    let mut file_paths = Vec::new();
    let mut seen_paths = HashSet::new();
    let mut error_excerpts = Vec::new();
    let mut code_blocks = Vec::new();

    for segment in &segments {
        match segment {
            Segment::Prose(prose) => {
                for path in extract_file_paths(prose) {
                    if seen_paths.insert(path.clone()) {
                        file_paths.push(path);
                    }
                }
                error_excerpts.extend(extract_error_runs(prose));
            }
            Segment::Fence(block) => {
                let block = block.trim();
                if block.is_empty() {
                    continue;
                }
                if stack_trace_re().is_match(block) {
                    error_excerpts.push(block.to_string());
                }
                code_blocks.push(block.to_string());
            }
        }
    }

    let category = classify(text);
    let fix_potential = match (!file_paths.is_empty(), !error_excerpts.is_empty()) {
        (true, true) => FixPotential::High,
        (true, false) | (false, true) => FixPotential::Medium,
        (false, false) if category == IssueCategory::Bug => FixPotential::Low,
        (false, false) => FixPotential::None,
    };
    let is_fixable = category == IssueCategory::Bug
        && matches!(fix_potential, FixPotential::High | FixPotential::Medium);

    IssueAnalysis {
        file_paths,
        error_excerpts,
        code_blocks,
        category,
        fix_potential,
        is_fixable,
    }
}

// ── Regexes ──────────────────────────────────────────────────────────────

#[allow(clippy::expect_used)]
fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static regex must compile"))
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, r"(?s)```(?:[A-Za-z0-9_+.\-]+[ \t]*\n|[ \t]*\n?)(.*?)```")
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, r"`([^`\n]+)`|(\S+)")
}

fn error_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(
        &RE,
        r"(?i)traceback|\b[a-z0-9_.]*(?:error:|exception\b)",
    )
}

fn stack_trace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, r"(?i)traceback|stack ?trace|exception|error:")
}

fn location_clause_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, r"\s+(?:in|at)\s+(\S+)")
}

fn line_suffix_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, r"(?::\d+)+$|#L\d+(?:-L?\d+)?$")
}

fn version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    compiled(&RE, r"^[vV]?\d+(?:\.\d+)+$")
}

// ── Fences ───────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq)]
enum Segment<'a> {
    Prose(&'a str),
    Fence(&'a str),
}

/// Split text into prose and fenced-block content, in document order.
/// An unclosed fence is left as prose.
fn split_fences(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut last = 0;
    for caps in fence_re().captures_iter(text) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if whole.start() > last {
            segments.push(Segment::Prose(&text[last..whole.start()]));
        }
        segments.push(Segment::Fence(body.as_str()));
        last = whole.end();
    }
    if last < text.len() {
        segments.push(Segment::Prose(&text[last..]));
    }
    segments
}

// ── File paths ───────────────────────────────────────────────────────────

fn extract_file_paths(prose: &str) -> Vec<String> {
    let mut out = Vec::new();
    for caps in token_re().captures_iter(prose) {
        if let Some(span) = caps.get(1) {
            for word in span.as_str().split_whitespace() {
                if let Some(path) = normalize_path_candidate(word, true) {
                    out.push(path);
                }
            }
        } else if let Some(word) = caps.get(2) {
            if let Some(path) = normalize_path_candidate(word.as_str(), false) {
                out.push(path);
            }
        }
    }
    out
}

/// Clean a token and return it if it looks like a repository path.
fn normalize_path_candidate(token: &str, in_code_span: bool) -> Option<String> {
    let lower = token.to_ascii_lowercase();
    if lower.contains("://") || lower.starts_with("www.") || token.contains('@') {
        return None;
    }

    let trimmed = token
        .trim_start_matches(|c: char| "\"'`([{<*".contains(c))
        .trim_end_matches(|c: char| "\"'`)]}>,;:.!?*".contains(c));
    let trimmed = line_suffix_re().replace(trimmed, "");
    let trimmed = trimmed.trim_start_matches("./");

    if trimmed.is_empty()
        || !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./-".contains(c))
        || trimmed.split('/').any(|seg| seg == "..")
        || version_re().is_match(trimmed)
    {
        return None;
    }

    let last_segment = trimmed.rsplit('/').next().unwrap_or(trimmed);
    if last_segment.is_empty() {
        return None;
    }
    let extension = last_segment
        .rsplit_once('.')
        .filter(|(stem, _)| !stem.is_empty())
        .map(|(_, ext)| ext.to_ascii_lowercase());

    let known = extension
        .as_deref()
        .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext));
    let has_slash = trimmed.contains('/');
    let plausible_ext = extension.as_deref().is_some_and(|ext| {
        (1..=10).contains(&ext.len())
            && ext.chars().any(|c| c.is_ascii_alphabetic())
            && !matches!(ext, "com" | "org" | "net")
    });

    if known || (has_slash && (in_code_span || plausible_ext)) {
        Some(trimmed.to_string())
    } else {
        None
    }
}

// ── Error excerpts ───────────────────────────────────────────────────────

/// Contiguous runs of error-looking lines in prose, one excerpt per run.
fn extract_error_runs(prose: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for line in prose.lines() {
        if let Some(m) = error_line_re().find(line) {
            if current.is_empty() {
                current.push(line[m.start()..].trim().to_string());
            } else {
                current.push(line.trim().to_string());
            }
            continue;
        }
        if !current.is_empty() && is_trace_continuation(line) {
            current.push(line.trim().to_string());
            continue;
        }
        if !current.is_empty() {
            runs.push(finish_run(std::mem::take(&mut current)));
        }
    }
    if !current.is_empty() {
        runs.push(finish_run(current));
    }
    runs.retain(|r| !r.is_empty());
    runs
}

fn is_trace_continuation(line: &str) -> bool {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        return false;
    }
    line.starts_with(char::is_whitespace)
        || trimmed.starts_with("File \"")
        || trimmed.starts_with("at ")
}

fn finish_run(lines: Vec<String>) -> String {
    if lines.len() == 1 {
        strip_location_clause(&lines[0])
    } else {
        lines.join("\n")
    }
}

/// `KeyError: 'x' in foo.py line 3` → `KeyError: 'x'`. Only cuts when the
/// clause names something path-like, so prose such as "in this scope" stays.
fn strip_location_clause(line: &str) -> String {
    for caps in location_clause_re().captures_iter(line) {
        let (Some(whole), Some(target)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if normalize_path_candidate(target.as_str(), false).is_some() {
            return line[..whole.start()]
                .trim_end_matches(|c: char| c.is_whitespace() || ",;".contains(c))
                .to_string();
        }
    }
    line.trim_end().to_string()
}

// ── Category ─────────────────────────────────────────────────────────────

/// Category comes from keyword scores alone; extracted evidence only feeds
/// fix potential.
fn classify(text: &str) -> IssueCategory {
    let lower = text.to_lowercase();

    let bug = BUG_WEIGHT * count_terms(&lower, BUG_TERMS, TermMatch::Prefix);
    let feature = FEATURE_WEIGHT * count_terms(&lower, FEATURE_TERMS, TermMatch::Word);
    let question = QUESTION_WEIGHT
        * (count_terms(&lower, QUESTION_TERMS, TermMatch::Word) + u32::from(lower.contains('?')));

    if bug > feature && bug > question {
        IssueCategory::Bug
    } else if feature > bug && feature > question {
        IssueCategory::Feature
    } else if question > bug && question > feature {
        IssueCategory::Question
    } else {
        IssueCategory::Other
    }
}

#[derive(Clone, Copy)]
enum TermMatch {
    /// Term must start at a word boundary ("fail" matches "fails").
    Prefix,
    /// Term must be a whole word or phrase.
    Word,
}

/// Number of distinct terms present, each counted once.
fn count_terms(lower: &str, terms: &[&str], mode: TermMatch) -> u32 {
    terms
        .iter()
        .filter(|term| contains_term(lower, term, mode))
        .count() as u32
}

fn contains_term(haystack: &str, term: &str, mode: TermMatch) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';
    haystack.match_indices(term).any(|(idx, _)| {
        let before_ok = haystack[..idx].chars().next_back().map_or(true, |c| !is_word(c));
        let after_ok = match mode {
            TermMatch::Prefix => true,
            TermMatch::Word => haystack[idx + term.len()..]
                .chars()
                .next()
                .map_or(true, |c| !is_word(c)),
        };
        before_ok && after_ok
    })
}

pub(crate) fn truncate_to_boundary(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
