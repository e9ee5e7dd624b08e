//! Invocation of backend command-line tools
//!
//! Cluster adapters talk to their resource manager exclusively through its
//! CLI. This module runs one tool, captures its output and provides the
//! small text helpers needed to build command lines and batch scripts.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Captured result of one tool invocation
#[derive(Debug, Clone)]
pub(crate) struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

impl ToolOutput {
    /// Converts a non-zero exit into a [`SchedulerError::Command`]
    pub(crate) fn checked(self, program: &str) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        Err(SchedulerError::command(program, self.describe()))
    }

    /// One-line summary for error messages
    pub(crate) fn describe(&self) -> String {
        format!(
            "exit_code={}, stdout='{}', stderr='{}'",
            self.exit_code,
            self.stdout.trim(),
            self.stderr.trim()
        )
    }
}

/// Runs `program` with `args`, optionally feeding `stdin`
///
/// Spawn failures (missing binary, permissions) surface as `io::Error`; a
/// tool that runs but exits non-zero is reported through
/// [`ToolOutput::success`].
pub(crate) async fn run_tool(
    program: &str,
    args: &[String],
    stdin: Option<&str>,
) -> std::io::Result<ToolOutput> {
    debug!("Running {} {:?}", program, args);

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn()?;

    if let Some(input) = stdin
        && let Some(mut pipe) = child.stdin.take()
    {
        pipe.write_all(input.as_bytes()).await?;
        pipe.shutdown().await?;
    }

    let output = child.wait_with_output().await?;

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !stdout.trim().is_empty() {
        debug!("{} stdout: {}", program, stdout.trim());
    }
    if !stderr.trim().is_empty() {
        debug!("{} stderr: {}", program, stderr.trim());
    }

    Ok(ToolOutput {
        stdout,
        stderr,
        exit_code: output.status.code().unwrap_or(-1),
        success: output.status.success(),
    })
}

/// Quotes one word for a POSIX shell
pub(crate) fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Joins words into a single shell command line
pub(crate) fn shell_join<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| shell_quote(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Formats a wall-clock limit as `HH:MM:SS`, as both sbatch and qsub accept
///
/// Rounds down to whole seconds, with a floor of one second.
pub(crate) fn format_walltime(limit: Duration) -> String {
    let total = limit.as_secs().max(1);
    format!(
        "{:02}:{:02}:{:02}",
        total / 3600,
        (total % 3600) / 60,
        total % 60
    )
}
