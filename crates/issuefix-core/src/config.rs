use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};

use crate::analyzer::DEFAULT_MAX_ISSUE_BYTES;
use crate::fixer::DEFAULT_MAX_TASK_BYTES;
use crate::git::CommitAuthor;
use crate::github::DEFAULT_API_BASE;
use crate::policy::POLICY_PATH;
use crate::retry::RetryPolicy;

/// Full application configuration, from the process environment with a
/// `.env` file as fallback.
#[derive(Debug, Clone)]
pub struct Config {
    // Platform
    pub github_token: String,
    pub github_api_base: String,
    /// Empty disables webhook signature verification.
    pub webhook_secret: String,
    /// Events authored by this login are ignored.
    pub bot_login: String,

    // Web
    pub web_bind: String,
    pub web_port: u16,

    // Agent
    /// "claude" (default) or "aider".
    pub backend: String,
    /// Agent executable; empty means the backend's default binary name.
    pub agent_bin: String,
    pub model: String,
    pub agent_timeout_s: u64,

    // Pipeline tuning
    pub workspace_root: String,
    pub run_timeout_s: u64,
    pub max_issue_bytes: usize,
    pub max_task_bytes: usize,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub max_concurrent_runs: usize,
    pub policy_path: String,
    /// JSONL file receiving one line per finished run. Empty disables it.
    pub audit_log: String,

    // Git attribution
    pub git_author_name: String,
    pub git_author_email: String,
}

/// The subset of [`Config`] the pipeline itself reads.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workspace_root: PathBuf,
    pub policy_path: String,
    pub agent_timeout: Duration,
    pub run_timeout: Duration,
    pub max_issue_bytes: usize,
    pub max_task_bytes: usize,
    pub retry: RetryPolicy,
    pub max_concurrent_runs: usize,
    /// How many recent delivery ids are remembered for duplicate detection.
    pub recent_deliveries: usize,
    pub author: CommitAuthor,
    pub audit_log: Option<PathBuf>,
    /// Login the pipeline posts as; events it authors are dropped.
    pub bot_login: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("issuefix"),
            policy_path: POLICY_PATH.to_string(),
            agent_timeout: Duration::from_secs(600),
            run_timeout: Duration::from_secs(30 * 60),
            max_issue_bytes: DEFAULT_MAX_ISSUE_BYTES,
            max_task_bytes: DEFAULT_MAX_TASK_BYTES,
            retry: RetryPolicy::default(),
            max_concurrent_runs: 4,
            recent_deliveries: 1024,
            author: CommitAuthor {
                name: "issuefix-bot".into(),
                email: "issuefix-bot@users.noreply.github.com".into(),
            },
            audit_log: None,
            bot_login: String::new(),
        }
    }
}

fn parse_dotenv() -> HashMap<String, String> {
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return HashMap::new();
    };
    parse_dotenv_str(&contents)
}

fn parse_dotenv_str(contents: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            let v = v.trim().trim_matches('"');
            map.insert(k.trim().to_string(), v.to_string());
        }
    }
    map
}

fn get_str(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: &str) -> String {
    lookup(key).unwrap_or_else(|| default.to_string())
}

fn get_u64(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn get_u32(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: u32) -> u32 {
    lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn get_u16(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: u16) -> u16 {
    lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn get_usize(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();
        Self::from_source(&|key| std::env::var(key).ok().or_else(|| dotenv.get(key).cloned()))
    }

    /// Build from an arbitrary key lookup. Unparsable numbers fall back to
    /// their defaults; an unknown backend is an error.
    pub fn from_source(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = PipelineSettings::default();
        let backend = get_str(lookup, "BACKEND", "claude").trim().to_lowercase();
        if !matches!(backend.as_str(), "claude" | "aider") {
            bail!("unknown BACKEND {backend:?}; expected \"claude\" or \"aider\"");
        }

        Ok(Self {
            github_token: get_str(lookup, "GITHUB_TOKEN", ""),
            github_api_base: get_str(lookup, "GITHUB_API_BASE", DEFAULT_API_BASE),
            webhook_secret: get_str(lookup, "GITHUB_WEBHOOK_SECRET", ""),
            bot_login: get_str(lookup, "BOT_LOGIN", ""),
            web_bind: get_str(lookup, "WEB_BIND", "0.0.0.0"),
            web_port: get_u16(lookup, "WEB_PORT", 8080),
            backend,
            agent_bin: get_str(lookup, "AGENT_BIN", ""),
            model: get_str(lookup, "MODEL", ""),
            agent_timeout_s: get_u64(lookup, "AGENT_TIMEOUT_S", defaults.agent_timeout.as_secs()),
            workspace_root: get_str(
                lookup,
                "WORKSPACE_ROOT",
                &defaults.workspace_root.to_string_lossy(),
            ),
            run_timeout_s: get_u64(lookup, "RUN_TIMEOUT_S", defaults.run_timeout.as_secs()),
            max_issue_bytes: get_usize(lookup, "MAX_ISSUE_BYTES", defaults.max_issue_bytes),
            max_task_bytes: get_usize(lookup, "MAX_TASK_BYTES", defaults.max_task_bytes),
            retry_max_attempts: get_u32(lookup, "RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)
                .max(1),
            retry_base_delay_ms: get_u64(
                lookup,
                "RETRY_BASE_DELAY_MS",
                defaults.retry.base_delay.as_millis() as u64,
            ),
            max_concurrent_runs: get_usize(lookup, "MAX_CONCURRENT_RUNS", defaults.max_concurrent_runs)
                .max(1),
            policy_path: get_str(lookup, "POLICY_PATH", POLICY_PATH),
            audit_log: get_str(lookup, "AUDIT_LOG", ""),
            git_author_name: get_str(lookup, "GIT_AUTHOR_NAME", &defaults.author.name),
            git_author_email: get_str(lookup, "GIT_AUTHOR_EMAIL", &defaults.author.email),
        })
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        let defaults = PipelineSettings::default();
        PipelineSettings {
            workspace_root: PathBuf::from(&self.workspace_root),
            policy_path: self.policy_path.clone(),
            agent_timeout: Duration::from_secs(self.agent_timeout_s),
            run_timeout: Duration::from_secs(self.run_timeout_s),
            max_issue_bytes: self.max_issue_bytes,
            max_task_bytes: self.max_task_bytes,
            retry: RetryPolicy {
                max_attempts: self.retry_max_attempts,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: defaults.retry.max_delay,
            },
            max_concurrent_runs: self.max_concurrent_runs,
            recent_deliveries: defaults.recent_deliveries,
            author: CommitAuthor {
                name: self.git_author_name.clone(),
                email: self.git_author_email.clone(),
            },
            audit_log: (!self.audit_log.trim().is_empty()).then(|| PathBuf::from(&self.audit_log)),
            bot_login: self.bot_login.trim().to_string(),
        }
    }
}
