use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

/// What an agent invocation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentOutput {
    /// Raw agent output, expected to follow the file-marker contract.
    Completed(String),
    TimedOut,
}

/// External code-modification agent. Implementations edit files inside
/// `working_copy` and return their final textual answer.
///
/// An `Err` means the agent could not be invoked at all (spawn failure,
/// broken pipe); it is reported as an agent failure, never retried.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        task_description: &str,
        working_copy: &Path,
        timeout: Duration,
    ) -> Result<AgentOutput>;

    /// Like [`AgentBackend::run`], with the repository-relative files the
    /// task is about. Backends that take explicit file arguments override it.
    async fn run_with_files(
        &self,
        task_description: &str,
        working_copy: &Path,
        target_paths: &[String],
        timeout: Duration,
    ) -> Result<AgentOutput> {
        let _ = target_paths;
        self.run(task_description, working_copy, timeout).await
    }
}
