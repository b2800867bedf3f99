use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

/// Captured output of a finished agent subprocess.
pub struct ProcessOutput {
    pub stdout: String,
    pub success: bool,
}

/// Spawn `cmd`, collect stdout line by line, forward stderr to the log, and
/// kill the child if it outlives `timeout`. `Ok(None)` means it timed out.
pub async fn run_with_timeout(
    mut cmd: Command,
    label: &str,
    timeout: Duration,
) -> Result<Option<ProcessOutput>> {
    let mut child = cmd
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {label}"))?;

    let stdout = child.stdout.take().context("failed to take stdout")?;
    let stderr = child.stderr.take().context("failed to take stderr")?;
    let label_owned = label.to_string();

    let io_future = async move {
        let mut raw = String::new();
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        loop {
            tokio::select! {
                line = stdout_reader.next_line() => {
                    match line.context("error reading stdout")? {
                        Some(l) => {
                            debug!(agent = %label_owned, "stdout: {}", l);
                            raw.push_str(&l);
                            raw.push('\n');
                        }
                        None => break,
                    }
                }
                line = stderr_reader.next_line() => {
                    if let Ok(Some(l)) = line {
                        if !l.is_empty() {
                            warn!(agent = %label_owned, "stderr: {}", l);
                        }
                    }
                }
            }
        }

        while let Ok(Some(l)) = stderr_reader.next_line().await {
            if !l.is_empty() {
                warn!(agent = %label_owned, "stderr: {}", l);
            }
        }

        let status = child.wait().await.context("failed to wait for agent")?;
        anyhow::Ok(ProcessOutput {
            stdout: raw,
            success: status.success(),
        })
    };

    // Dropping the future on timeout drops the child, which kills it.
    match tokio::time::timeout(timeout, io_future).await {
        Ok(Ok(out)) => Ok(Some(out)),
        Ok(Err(e)) => Err(e),
        Err(_elapsed) => {
            warn!(agent = label, timeout_s = timeout.as_secs(), "agent subprocess timed out");
            Ok(None)
        }
    }
}
