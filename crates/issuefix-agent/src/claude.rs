use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use issuefix_core::agent::{AgentBackend, AgentOutput};
use tokio::process::Command;
use tracing::{info, warn};

use crate::event::parse_stream;
use crate::process::run_with_timeout;

const ALLOWED_TOOLS: &str = "Read,Glob,Grep,Write,Edit";
const DEFAULT_MAX_TURNS: u32 = 40;

/// Runs Claude Code headless inside the working copy.
pub struct ClaudeBackend {
    /// Path to the `claude` CLI binary.
    pub claude_bin: String,
    /// Model override; empty uses the CLI default.
    pub model: String,
    pub max_turns: u32,
}

impl ClaudeBackend {
    pub fn new(claude_bin: impl Into<String>, model: impl Into<String>) -> Self {
        let claude_bin = claude_bin.into();
        Self {
            claude_bin: if claude_bin.is_empty() { "claude".into() } else { claude_bin },
            model: model.into(),
            max_turns: DEFAULT_MAX_TURNS,
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    pub fn build_args(&self, task_description: &str) -> Vec<String> {
        let mut args = vec![
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--allowedTools".to_string(),
            ALLOWED_TOOLS.to_string(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
        ];
        if !self.model.is_empty() {
            args.push("--model".into());
            args.push(self.model.clone());
        }
        args.push("--print".into());
        args.push(task_description.to_string());
        args
    }
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &str {
        "claude"
    }

    async fn run(
        &self,
        task_description: &str,
        working_copy: &Path,
        timeout: Duration,
    ) -> Result<AgentOutput> {
        info!(
            dir = %working_copy.display(),
            model = %self.model,
            task_bytes = task_description.len(),
            "starting claude agent"
        );

        let mut cmd = Command::new(&self.claude_bin);
        cmd.args(self.build_args(task_description))
            .current_dir(working_copy);

        let Some(out) = run_with_timeout(cmd, "claude", timeout).await? else {
            return Ok(AgentOutput::TimedOut);
        };

        let summary = parse_stream(&out.stdout);
        info!(
            success = out.success,
            session_id = summary.session_id.as_deref().unwrap_or(""),
            tools = summary.tools_used.len(),
            output_bytes = summary.text.len(),
            "claude agent finished"
        );

        if !out.success && summary.text.is_empty() {
            bail!("claude exited with failure and no output");
        }
        if summary.is_error {
            warn!("claude reported an error result");
            if summary.text.is_empty() {
                bail!("claude reported an error result");
            }
        }
        Ok(AgentOutput::Completed(summary.text))
    }
}
