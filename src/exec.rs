//! Timeout-bounded command execution.

use std::process::Stdio;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// Outcome of one execution attempt. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub return_code: i32,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl ExecutionResult {
    fn failure(stderr: String, elapsed: Duration) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr,
            return_code: -1,
            elapsed,
        }
    }

    /// JSON form stored in the audit log.
    pub fn to_summary(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(
                "{{\"success\":{},\"return_code\":{},\"error\":\"unserializable result: {e}\"}}",
                self.success, self.return_code
            )
        })
    }
}

/// `elapsed` as fractional seconds on the wire.
mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::try_from_secs_f64(secs).unwrap_or_default())
    }
}

/// Runs accepted commands through `sh -c`.
#[derive(Debug, Clone, Copy)]
pub struct CommandExecutor {
    timeout: Duration,
}

impl CommandExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute or simulate `command`. Launch failures and timeouts are folded
    /// into the result with `return_code == -1`.
    pub async fn execute(&self, command: &str, dry_run: bool) -> ExecutionResult {
        if dry_run {
            info!("[DRY RUN] would execute: {command}");
            return ExecutionResult {
                success: true,
                stdout: format!("[DRY RUN] {command}"),
                stderr: String::new(),
                return_code: 0,
                elapsed: Duration::ZERO,
            };
        }

        let start = Instant::now();
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so a timeout can take down everything the shell
        // started, not just the shell.
        #[cfg(unix)]
        cmd.process_group(0);
        let child = cmd.spawn();

        let child = match child {
            Ok(c) => c,
            Err(e) => {
                warn!("failed to launch {command:?}: {e}");
                return ExecutionResult::failure(format!("failed to launch: {e}"), start.elapsed());
            }
        };

        let pid = child.id();
        // Dropping the wait future on timeout drops the child, which kills it.
        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let return_code = output.status.code().unwrap_or(-1);
                let elapsed = start.elapsed();
                debug!("{command:?} exited with {return_code} in {elapsed:?}");
                ExecutionResult {
                    success: output.status.success(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    return_code,
                    elapsed,
                }
            }
            Ok(Err(e)) => {
                warn!("failed waiting on {command:?}: {e}");
                ExecutionResult::failure(format!("failed to collect output: {e}"), start.elapsed())
            }
            Err(_) => {
                kill_process_group(pid);
                warn!("{command:?} timed out after {}s", self.timeout.as_secs());
                ExecutionResult::failure(
                    format!("command timed out after {}s", self.timeout.as_secs()),
                    start.elapsed(),
                )
            }
        }
    }
}

/// SIGKILL the process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        // ESRCH: the whole group already exited.
        debug!("killpg({pid}): {e}");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dry_run_never_spawns() {
        let exec = CommandExecutor::default();
        let r = exec.execute("definitely-not-a-binary --flag", true).await;
        assert!(r.success);
        assert_eq!(r.return_code, 0);
        assert_eq!(r.stdout, "[DRY RUN] definitely-not-a-binary --flag");
        assert_eq!(r.elapsed, Duration::ZERO);
    }

    #[tokio::test]
    async fn captures_stdout() {
        let r = CommandExecutor::default().execute("echo hello", false).await;
        assert!(r.success);
        assert_eq!(r.return_code, 0);
        assert!(r.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn captures_stderr_and_exit_code() {
        let r = CommandExecutor::default()
            .execute("echo oops >&2; exit 3", false)
            .await;
        assert!(!r.success);
        assert_eq!(r.return_code, 3);
        assert!(r.stderr.contains("oops"));
    }

    #[tokio::test]
    async fn unknown_command_fails_cleanly() {
        let r = CommandExecutor::default()
            .execute("no-such-command-cmdgate", false)
            .await;
        assert!(!r.success);
        assert_eq!(r.return_code, 127);
    }

    #[tokio::test]
    async fn timeout_kills_and_reports() {
        let exec = CommandExecutor::new(Duration::from_secs(1));
        let r = exec.execute("sleep 5", false).await;
        assert!(!r.success);
        assert_eq!(r.return_code, -1);
        assert!(r.stderr.contains("timed out"));
        assert!(r.elapsed >= Duration::from_millis(900), "{:?}", r.elapsed);
        assert!(r.elapsed < Duration::from_secs(3), "{:?}", r.elapsed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_background_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let command = format!("sh -c 'sleep 2; touch {}'; true", marker.display());

        let r = CommandExecutor::new(Duration::from_secs(1))
            .execute(&command, false)
            .await;
        assert_eq!(r.return_code, -1);
        assert!(r.stderr.contains("timed out"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!marker.exists(), "descendant ran after the timeout");
    }

    #[test]
    fn summary_is_json_with_fractional_elapsed() {
        let r = ExecutionResult {
            success: true,
            stdout: "hi\n".into(),
            stderr: String::new(),
            return_code: 0,
            elapsed: Duration::from_millis(1500),
        };
        let v: serde_json::Value = serde_json::from_str(&r.to_summary()).unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["elapsed"], 1.5);
        let back: ExecutionResult = serde_json::from_str(&r.to_summary()).unwrap();
        assert_eq!(back, r);
    }
}
