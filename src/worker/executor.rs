use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::job::JobOutcome;

/// Process-wide ceiling on a single job's runtime.
pub const EXEC_TIMEOUT: Duration = Duration::from_secs(3600);

/// Error snippets are bounded; only the stderr tail survives.
const ERROR_SNIPPET_MAX: usize = 500;

/// Runs job commands through the shell and classifies the result.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    timeout: Duration,
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner {
    pub fn new() -> Self {
        Self {
            timeout: EXEC_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Execute `sh -c <command>` and wait for it, up to the ceiling.
    ///
    /// Success iff the child exits 0. A child still running at the ceiling is
    /// killed and counted as a failure. Spawn errors become failures too;
    /// nothing here is surfaced to the operator directly.
    pub async fn run(&self, job_id: &str, command: &str) -> JobOutcome {
        tracing::info!(job_id = %job_id, command, "Executing job");

        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let child = match child {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to spawn command");
                return JobOutcome::Failure(format!("failed to spawn command: {e}"));
            }
        };

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            // Dropping the in-flight wait kills the child (kill_on_drop).
            Err(_) => {
                tracing::warn!(job_id = %job_id, timeout_secs = self.timeout.as_secs(), "Execution timeout");
                JobOutcome::Failure("execution-timeout".to_string())
            }
            Ok(Err(e)) => JobOutcome::Failure(format!("failed to collect command output: {e}")),
            Ok(Ok(output)) if output.status.success() => {
                tracing::info!(job_id = %job_id, "Command succeeded");
                JobOutcome::Success
            }
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let snippet = tail(stderr.trim(), ERROR_SNIPPET_MAX);
                let message = match output.status.code() {
                    Some(code) if snippet.is_empty() => {
                        format!("command failed with exit code {code}")
                    }
                    Some(code) => format!("command failed with exit code {code}: {snippet}"),
                    None => format!("command terminated by signal: {snippet}"),
                };
                tracing::warn!(job_id = %job_id, error = %message, "Command failed");
                JobOutcome::Failure(message)
            }
        }
    }
}

fn tail(s: &str, max: usize) -> &str {
    let mut start = s.len().saturating_sub(max);
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

#[cfg(test)]
mod tests {
    use super::tail;

    #[test]
    fn tail_keeps_short_strings_whole() {
        assert_eq!(tail("boom", 500), "boom");
    }

    #[test]
    fn tail_cuts_on_char_boundaries() {
        let s = "xπππ";
        assert_eq!(tail(s, 3), "π");
        assert_eq!(tail(s, 4), "ππ");
    }
}
