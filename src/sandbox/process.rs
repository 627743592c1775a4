//! Out-of-process Python harness.
//!
//! Every interaction with generated code goes through one embedded script run
//! by a fresh interpreter: the request is JSON on stdin, the reply is the JSON
//! that follows the last [`RESULT_MARKER`] on stdout. The process is killed
//! when the wall-clock timeout expires, and on Unix it runs under `ulimit`
//! caps for address space and CPU time.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::SandboxError;
use crate::config::SandboxConfig;

pub const RESULT_MARKER: &str = "@@HARNESS_RESULT@@";

const HARNESS_SOURCE: &str = include_str!("harness.py");

/// What the harness is asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessMode {
    /// Compile only.
    Check,
    /// Execute as a program with captured stdout/stderr.
    Run,
    /// List top-level functions and classes.
    Introspect,
    /// Load once and invoke a plan of test cases.
    Test,
    /// Report which modules cannot be found.
    Probe,
}

impl HarnessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Check => "check",
            Self::Run => "run",
            Self::Introspect => "introspect",
            Self::Test => "test",
            Self::Probe => "probe",
        }
    }
}

/// Parsed harness reply plus whatever else the process wrote.
#[derive(Debug, Clone)]
pub struct HarnessReply {
    pub payload: Value,
    /// Process stdout that was not captured by the harness (e.g. child processes).
    pub stray_stdout: String,
    pub stderr: String,
}

impl HarnessReply {
    pub fn ok(&self) -> bool {
        self.payload.get("ok").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn str_field(&self, key: &str) -> &str {
        self.payload.get(key).and_then(Value::as_str).unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Harness {
    python: String,
    timeout: Duration,
    memory_limit_mb: u64,
    cpu_limit_secs: u64,
}

impl Harness {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            python: config.python.clone(),
            timeout: config.exec_timeout,
            memory_limit_mb: config.memory_limit_mb,
            cpu_limit_secs: config.cpu_limit_secs,
        }
    }

    pub fn python(&self) -> &str {
        &self.python
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Shell prefix applying resource caps for a run allowed `budget` of
    /// wall-clock time, empty when no caps are configured. Budget beyond the
    /// configured timeout is added to the CPU cap.
    fn limits_prefix_for(&self, budget: Duration) -> String {
        let cpu_limit_secs = if self.cpu_limit_secs > 0 {
            let extra = budget.saturating_sub(self.timeout).as_secs_f64().ceil() as u64;
            self.cpu_limit_secs.saturating_add(extra)
        } else {
            0
        };
        let mut prefix = String::new();
        if self.memory_limit_mb > 0 {
            prefix.push_str(&format!(
                "ulimit -v {} 2>/dev/null; ",
                self.memory_limit_mb.saturating_mul(1024)
            ));
        }
        if cpu_limit_secs > 0 {
            prefix.push_str(&format!("ulimit -t {} 2>/dev/null; ", cpu_limit_secs));
        }
        prefix
    }

    fn command(&self, mode: HarnessMode, cwd: &Path, budget: Duration) -> Command {
        let limits = self.limits_prefix_for(budget);
        let mut cmd = if cfg!(unix) && !limits.is_empty() {
            // The interpreter and its arguments arrive as "$0" "$@", so nothing
            // needs quoting.
            let mut cmd = Command::new("/bin/sh");
            cmd.arg("-c")
                .arg(format!("{}exec \"$0\" \"$@\"", limits))
                .arg(&self.python);
            cmd
        } else {
            Command::new(&self.python)
        };

        cmd.arg("-c")
            .arg(HARNESS_SOURCE)
            .arg(mode.as_str())
            .current_dir(cwd)
            .env("MPLBACKEND", "Agg")
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run the harness in `mode` with `request` as input.
    pub async fn invoke(
        &self,
        mode: HarnessMode,
        request: &Value,
        cwd: &Path,
    ) -> Result<HarnessReply, SandboxError> {
        self.invoke_with_timeout(mode, request, cwd, self.timeout).await
    }

    /// Like [`Harness::invoke`], with a wall-clock limit other than the configured one.
    pub async fn invoke_with_timeout(
        &self,
        mode: HarnessMode,
        request: &Value,
        cwd: &Path,
        timeout: Duration,
    ) -> Result<HarnessReply, SandboxError> {
        let input = serde_json::to_vec(request)?;
        let mut child = self
            .command(mode, cwd, timeout)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                program: self.python.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&input).await.map_err(SandboxError::Io)?;
            // Dropping closes the pipe so the harness sees EOF.
            drop(stdin);
        }

        tracing::debug!(mode = mode.as_str(), cwd = %cwd.display(), "Harness started");

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(SandboxError::Io(e)),
            Err(_) => {
                tracing::warn!(mode = mode.as_str(), timeout_secs = timeout.as_secs(), "Harness timed out");
                return Err(SandboxError::Timeout(timeout));
            }
        };

        let stdout = sanitize_output(&output.stdout);
        let stderr = sanitize_output(&output.stderr);

        let Some((stray_stdout, payload)) = split_reply(&stdout) else {
            return Err(SandboxError::NoResult {
                code: output.status.code(),
                stderr,
            });
        };
        let payload: Value = serde_json::from_str(payload)?;

        tracing::debug!(mode = mode.as_str(), exit = ?output.status.code(), "Harness finished");
        Ok(HarnessReply {
            payload,
            stray_stdout: stray_stdout.trim_end_matches('\n').to_string(),
            stderr,
        })
    }
}

/// Split stdout at the last marker into (text before, JSON line after).
fn split_reply(stdout: &str) -> Option<(&str, &str)> {
    let at = stdout.rfind(RESULT_MARKER)?;
    let rest = &stdout[at + RESULT_MARKER.len()..];
    let line = rest.lines().next().unwrap_or_default();
    Some((&stdout[..at], line.trim()))
}

/// Decode process output, dropping NULs and other control bytes.
///
/// Mostly-binary output is replaced by a short notice.
pub fn sanitize_output(bytes: &[u8]) -> String {
    let non_printable = bytes
        .iter()
        .filter(|&&b| b < 0x20 && b != b'\n' && b != b'\r' && b != b'\t')
        .count();

    if bytes.len() > 100 && non_printable > bytes.len() / 10 {
        return format!(
            "[Binary output detected - {} bytes, {}% non-printable]",
            bytes.len(),
            non_printable * 100 / bytes.len()
        );
    }

    String::from_utf8_lossy(bytes)
        .chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || c >= ' ')
        .collect()
}

/// Whether `python` can be started at all.
pub async fn python_available(python: &str) -> bool {
    Command::new(python)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}
