//! The sandboxed command executor.
//!
//! Runs an approved command under strict bounds: `/bin/bash -c` as a single
//! argument, a canonicalized working directory, a wall-clock deadline
//! enforced by SIGKILL, 10 KiB of captured output per stream, and an
//! environment reduced to a fixed allow-list. The executor holds no
//! registry or ledger state; it returns an [`ExecutionResult`] and the
//! governor does the bookkeeping.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use brainloop_core::security::{matches_dangerous_pattern, SecurityEvent};
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use crate::error::{Error, Result};

/// Default wall-clock budget for one command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Captured bytes per stream; the rest is discarded.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 10 * 1024;

/// Environment variables passed through to the child.
const ENV_ALLOW_LIST: &[&str] = &[
    "PATH", "HOME", "USER", "LANG", "LC_ALL", "TERM", "SHELL", "PWD", "OLDPWD", "SHLVL",
    "HOSTNAME", "HOSTTYPE", "OSTYPE", "MACHTYPE", "LOGNAME",
];

const SENSITIVE_PREFIXES: &[&str] = &["AWS_", "SSH_", "GIT_"];
const SENSITIVE_SUBSTRINGS: &[&str] = &["TOKEN", "SECRET", "PASSWORD", "API_KEY", "PRIVATE_KEY"];

/// Outcome of one sandboxed execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: i64,
    pub was_timeout: bool,
    pub was_truncated: bool,
}

impl ExecutionResult {
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0 && !self.was_timeout
    }
}

/// Configured executor; one instance serves the whole worker.
#[derive(Debug, Clone)]
pub struct Executor {
    timeout: Duration,
    max_output_bytes: usize,
    working_dir: PathBuf,
}

impl Executor {
    /// Creates an executor rooted at `working_dir`.
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            working_dir: working_dir.into(),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    /// Runs `command` under the configured bounds.
    ///
    /// The dangerous-pattern pre-flight runs here as the last line of
    /// defense: even a `force_execute` request cannot reach the shell with
    /// a deny-listed command.
    ///
    /// # Errors
    ///
    /// - `PolicyDenied` on a dangerous-pattern match.
    /// - `InvalidInput` when the working directory does not resolve.
    /// - `ExternalFailure` when the child cannot be spawned.
    pub async fn execute(&self, command: &str) -> Result<ExecutionResult> {
        if let Some(pattern) = matches_dangerous_pattern(command) {
            SecurityEvent::new(command, "DANGEROUS_PATTERN_BLOCKED", pattern).emit();
            return Err(Error::PolicyDenied(format!(
                "command blocked by dangerous pattern: {pattern}"
            )));
        }

        let cwd = self.resolve_working_dir()?;
        let started = Instant::now();

        let mut child = Command::new("/bin/bash")
            .arg("-c")
            .arg(command)
            .current_dir(&cwd)
            .env_clear()
            .envs(filtered_environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ExternalFailure(format!("failed to spawn shell: {e}")))?;

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        let cap = self.max_output_bytes;
        let stdout_task = tokio::spawn(read_capped(stdout, cap));
        let stderr_task = tokio::spawn(read_capped(stderr, cap));

        let (exit_code, was_timeout) =
            match tokio::time::timeout(self.timeout, child.wait()).await {
                Ok(Ok(status)) => (status.code().unwrap_or(-1), false),
                Ok(Err(e)) => {
                    return Err(Error::ExternalFailure(format!("wait failed: {e}")));
                },
                Err(_) => {
                    // Deadline exceeded: SIGKILL and reap.
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    (-1, true)
                },
            };

        let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
        let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();

        let result = ExecutionResult {
            exit_code,
            stdout,
            stderr,
            duration_ms: started.elapsed().as_millis() as i64,
            was_timeout,
            was_truncated: stdout_truncated || stderr_truncated,
        };

        tracing::debug!(
            exit_code = result.exit_code,
            duration_ms = result.duration_ms,
            was_timeout = result.was_timeout,
            was_truncated = result.was_truncated,
            "command finished"
        );
        Ok(result)
    }

    fn resolve_working_dir(&self) -> Result<PathBuf> {
        let canonical = self.working_dir.canonicalize().map_err(|e| {
            Error::InvalidInput(format!(
                "invalid working directory {}: {e}",
                self.working_dir.display()
            ))
        })?;
        if !canonical.is_dir() {
            return Err(Error::InvalidInput(format!(
                "working directory {} is not a directory",
                canonical.display()
            )));
        }
        Ok(canonical)
    }
}

/// Reads up to `cap` bytes from the stream, draining (and discarding) the
/// remainder so the child never blocks on a full pipe.
async fn read_capped<R>(mut reader: R, cap: usize) -> (String, bool)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut kept = Vec::with_capacity(cap.min(4096));
    let mut truncated = false;
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if kept.len() < cap {
                    let take = n.min(cap - kept.len());
                    kept.extend_from_slice(&chunk[..take]);
                    if take < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            },
        }
    }
    (String::from_utf8_lossy(&kept).into_owned(), truncated)
}

/// The filtered environment handed to every child: allow-listed names
/// only, minus anything that looks like a credential.
fn filtered_environment() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(key, _)| ENV_ALLOW_LIST.contains(&key.as_str()))
        .filter(|(key, _)| !is_sensitive(key))
        .collect()
}

fn is_sensitive(key: &str) -> bool {
    SENSITIVE_PREFIXES.iter().any(|p| key.starts_with(p))
        || SENSITIVE_SUBSTRINGS.iter().any(|s| key.contains(s))
}

/// Checks a candidate working directory without constructing an executor.
pub fn working_dir_is_valid(dir: &Path) -> bool {
    dir.canonicalize().map(|p| p.is_dir()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor() -> Executor {
        Executor::new(std::env::temp_dir())
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let result = executor().execute("echo hello").await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
        assert!(!result.was_timeout);
        assert!(!result.was_truncated);
    }

    #[tokio::test]
    async fn captures_stderr_and_failure() {
        let result = executor()
            .execute("echo oops >&2; exit 3")
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[tokio::test]
    async fn timeout_kills_the_child() {
        let executor = executor().with_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let result = executor.execute("sleep 5").await.unwrap();
        assert!(result.was_timeout);
        assert!(!result.success());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn output_is_capped_per_stream() {
        let executor = executor().with_max_output_bytes(1024);
        let result = executor
            .execute("head -c 65536 /dev/zero | tr '\\0' 'a'")
            .await
            .unwrap();
        assert!(result.was_truncated);
        assert_eq!(result.stdout.len(), 1024);
    }

    #[tokio::test]
    async fn runs_in_the_configured_directory() {
        let dir = tempfile::tempdir().unwrap();
        let executor = Executor::new(dir.path());
        let result = executor.execute("pwd").await.unwrap();
        let reported = PathBuf::from(result.stdout.trim());
        assert_eq!(reported, dir.path().canonicalize().unwrap());
    }

    #[tokio::test]
    async fn invalid_working_directory_fails_fast() {
        let executor = Executor::new("/definitely/not/a/real/path");
        let err = executor.execute("echo hi").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn dangerous_pattern_preflight_blocks_execution() {
        let marker = std::env::temp_dir().join("brainloop-executor-preflight-marker");
        let _ = std::fs::remove_file(&marker);
        // The command would create the marker file if it ever ran.
        let command = format!("rm -rf / ; touch {}", marker.display());
        let err = executor().execute(&command).await.unwrap_err();
        assert!(matches!(err, Error::PolicyDenied(_)));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn environment_is_filtered() {
        std::env::set_var("BRAINLOOP_TEST_API_KEY", "supersecret");
        std::env::set_var("AWS_ACCESS_KEY_ID", "AKIA123");
        let result = executor().execute("env").await.unwrap();
        assert!(!result.stdout.contains("BRAINLOOP_TEST_API_KEY"));
        assert!(!result.stdout.contains("AKIA123"));
        // PATH survives the filter; bash needs it to find coreutils.
        assert!(result.stdout.contains("PATH="));
        std::env::remove_var("BRAINLOOP_TEST_API_KEY");
        std::env::remove_var("AWS_ACCESS_KEY_ID");
    }

    #[test]
    fn sensitivity_rules() {
        assert!(is_sensitive("AWS_REGION"));
        assert!(is_sensitive("SSH_AUTH_SOCK"));
        assert!(is_sensitive("GIT_DIR"));
        assert!(is_sensitive("MY_TOKEN"));
        assert!(is_sensitive("DB_PASSWORD"));
        assert!(!is_sensitive("PATH"));
        assert!(!is_sensitive("HOME"));
    }
}
