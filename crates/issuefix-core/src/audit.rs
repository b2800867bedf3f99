use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::types::PipelineRun;

/// Append-only JSONL record of finished runs.
pub struct AuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one line for `run`. Failures are logged and swallowed.
    pub async fn append(&self, run: &PipelineRun) {
        if let Err(e) = self.try_append(run).await {
            warn!(run_id = %run.run_id, path = %self.path.display(), "audit log write failed: {e:#}");
        }
    }

    async fn try_append(&self, run: &PipelineRun) -> Result<()> {
        let mut line = serde_json::to_string(run).context("failed to serialize run")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("failed to open {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
