use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use issuefix_core::agent::{AgentBackend, AgentOutput};
use tokio::process::Command;
use tracing::info;

use crate::process::run_with_timeout;

/// Runs aider non-interactively. Aider edits files in place and never
/// touches git; the pipeline picks its edits up from the working copy.
/// History files live outside the working copy so they never end up in a
/// commit.
pub struct AiderBackend {
    pub aider_bin: String,
    /// Model override; empty uses aider's default.
    pub model: String,
}

impl AiderBackend {
    pub fn new(aider_bin: impl Into<String>, model: impl Into<String>) -> Self {
        let aider_bin = aider_bin.into();
        Self {
            aider_bin: if aider_bin.is_empty() { "aider".into() } else { aider_bin },
            model: model.into(),
        }
    }

    pub fn build_args(&self, task_description: &str, history_dir: &Path, files: &[String]) -> Vec<String> {
        let mut args = vec![
            "--yes".to_string(),
            "--no-git".to_string(),
            "--no-gitignore".to_string(),
            "--no-auto-commits".to_string(),
            "--no-dirty-commits".to_string(),
            "--no-pretty".to_string(),
            "--no-stream".to_string(),
            "--chat-history-file".to_string(),
            history_dir.join("chat.md").to_string_lossy().into_owned(),
            "--input-history-file".to_string(),
            history_dir.join("input").to_string_lossy().into_owned(),
        ];
        if !self.model.is_empty() {
            args.push("--model".into());
            args.push(self.model.clone());
        }
        args.push("--message".into());
        args.push(task_description.to_string());
        args.extend(files.iter().cloned());
        args
    }
}

/// Per-working-copy scratch directory for aider's history files.
fn history_dir(working_copy: &Path) -> PathBuf {
    let name = working_copy
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "default".into());
    std::env::temp_dir().join(format!("issuefix-aider-{}-{name}", std::process::id()))
}

#[async_trait]
impl AgentBackend for AiderBackend {
    fn name(&self) -> &str {
        "aider"
    }

    async fn run(
        &self,
        task_description: &str,
        working_copy: &Path,
        timeout: Duration,
    ) -> Result<AgentOutput> {
        self.run_with_files(task_description, working_copy, &[], timeout).await
    }

    async fn run_with_files(
        &self,
        task_description: &str,
        working_copy: &Path,
        target_paths: &[String],
        timeout: Duration,
    ) -> Result<AgentOutput> {
        // Aider creates files it is handed, so only pass ones that exist.
        let files: Vec<String> = target_paths
            .iter()
            .filter(|p| working_copy.join(p).is_file())
            .cloned()
            .collect();
        info!(
            dir = %working_copy.display(),
            model = %self.model,
            files = files.len(),
            "starting aider agent"
        );

        let history = history_dir(working_copy);
        tokio::fs::create_dir_all(&history).await?;

        let mut cmd = Command::new(&self.aider_bin);
        cmd.args(self.build_args(task_description, &history, &files))
            .current_dir(working_copy)
            .env("AIDER_CHECK_UPDATE", "false");

        let result = run_with_timeout(cmd, "aider", timeout).await;
        let _ = tokio::fs::remove_dir_all(&history).await;
        let Some(out) = result? else {
            return Ok(AgentOutput::TimedOut);
        };

        info!(success = out.success, output_bytes = out.stdout.len(), "aider agent finished");
        if !out.success {
            bail!("aider exited with failure: {}", tail(&out.stdout, 500));
        }
        Ok(AgentOutput::Completed(out.stdout))
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
