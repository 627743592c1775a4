//! Sandboxed execution of whole-program source units.
//!
//! [`Sandbox::execute`] never fails: every problem (syntax error, runtime
//! fault, timeout, missing interpreter, copy failure) is folded into the
//! returned [`RunResult`].

pub mod artifacts;
pub mod deps;
pub mod process;
mod sanitize;

pub use process::{python_available, Harness, HarnessMode, HarnessReply, RESULT_MARKER};
pub use sanitize::sanitize_code;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use thiserror::Error;

use crate::config::SandboxConfig;
use crate::workspace::RunResult;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Execution timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Interpreter exited without a result (exit code {code:?}): {stderr}")]
    NoResult { code: Option<i32>, stderr: String },

    #[error("Invalid harness message: {0}")]
    BadMessage(#[from] serde_json::Error),

    #[error("Failed to prepare scratch directory: {0}")]
    Scratch(std::io::Error),

    #[error("I/O error talking to interpreter: {0}")]
    Io(std::io::Error),
}

/// Runs source units out of process.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
    harness: Harness,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        let harness = Harness::new(&config);
        Self { config, harness }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn harness(&self) -> &Harness {
        &self.harness
    }

    /// Fresh scratch directory, deleted when the returned guard drops.
    pub fn scratch_dir(&self) -> Result<TempDir, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("sandbox-");
        match &self.config.scratch_root {
            Some(root) => {
                std::fs::create_dir_all(root).map_err(SandboxError::Scratch)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(SandboxError::Scratch)
    }

    /// Execute `source` and report what happened.
    ///
    /// `attachments` are copied into the working directory and exposed to the
    /// program as the `attachments` mapping (file name to path). When
    /// `result_dir` is given, image and document files left in the working
    /// directory are copied there, and the attachments are guaranteed to be
    /// present too.
    pub async fn execute(
        &self,
        source: &str,
        result_dir: Option<&Path>,
        attachments: &[PathBuf],
    ) -> RunResult {
        let code = sanitize_code(source);
        let mut result = RunResult {
            source_code: code.clone(),
            ..RunResult::default()
        };

        let scratch = match self.scratch_dir() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(error = %e, "Cannot create sandbox working directory");
                result.error = format!("Sandbox Error: {}", e);
                return result;
            }
        };
        let work_dir = scratch.path();

        // Syntax check.
        match self
            .harness
            .invoke(HarnessMode::Check, &json!({ "source": code }), work_dir)
            .await
        {
            Ok(reply) if reply.ok() => {}
            Ok(reply) => {
                result.error = reply.str_field("error").to_string();
                tracing::info!(error = %result.error, "Source failed syntax check");
                return result;
            }
            Err(e) => {
                tracing::error!(error = %e, "Syntax check could not run");
                result.error = format!("Sandbox Error: {}", e);
                return result;
            }
        }
        result.compiled = true;

        result.warnings = deps::resolve(
            &self.harness,
            &code,
            work_dir,
            self.config.auto_install,
            self.config.install_timeout,
        )
        .await;

        let staged = artifacts::stage_attachments(attachments, work_dir).await;
        for error in &staged.errors {
            result.append_error(error);
        }

        match self
            .harness
            .invoke(
                HarnessMode::Run,
                &json!({ "source": code, "attachments": staged.exposed }),
                work_dir,
            )
            .await
        {
            Ok(reply) => apply_run_reply(&mut result, &reply),
            Err(SandboxError::Timeout(limit)) => {
                result.error = format!("Execution timed out after {}s", limit.as_secs());
            }
            Err(SandboxError::NoResult { code, stderr }) => {
                result.error = format!(
                    "Runtime Error: interpreter exited unexpectedly (exit code {})",
                    code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string())
                );
                if !stderr.trim().is_empty() {
                    result.append_error(stderr.trim_end());
                }
            }
            Err(e) => {
                result.error = format!("Sandbox Error: {}", e);
            }
        }

        if let Some(result_dir) = result_dir {
            let collected = artifacts::collect(work_dir, result_dir, &staged.copies).await;
            let attached = artifacts::ensure_attachments(attachments, result_dir).await;
            for error in collected.errors.iter().chain(attached.errors.iter()) {
                result.append_error(error);
            }
            result.artifacts = collected
                .copied
                .iter()
                .chain(attached.copied.iter())
                .map(|p| p.to_string_lossy().to_string())
                .collect();
        }

        tracing::info!(
            compiled = result.compiled,
            ok = result.succeeded(),
            artifacts = result.artifacts.len(),
            warnings = result.warnings.len(),
            "Execution finished"
        );
        result
    }
}

fn apply_run_reply(result: &mut RunResult, reply: &HarnessReply) {
    let mut output = reply.stray_stdout.clone();
    let captured = reply.str_field("output");
    if !output.is_empty() && !captured.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(captured);
    result.output = output;

    let stderr = reply.str_field("stderr");
    if reply.ok() {
        result.append_error(stderr);
        return;
    }

    let mut error = format!("Runtime Error: {}", reply.str_field("error"));
    let trace = reply.str_field("traceback").trim_end();
    if !trace.is_empty() {
        error.push('\n');
        error.push_str(trace);
    }
    result.append_error(error);
    if !stderr.trim().is_empty() {
        result.append_error(stderr.trim_end());
    }
    // Interpreter-level noise (e.g. warnings printed before the harness captured output).
    if !reply.stderr.trim().is_empty() {
        result.append_error(reply.stderr.trim_end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sandbox() -> Option<Sandbox> {
        if !python_available("python3").await {
            eprintln!("python3 not available, skipping");
            return None;
        }
        Some(Sandbox::new(SandboxConfig {
            exec_timeout: Duration::from_secs(20),
            auto_install: false,
            ..SandboxConfig::default()
        }))
    }

    #[tokio::test]
    async fn executes_simple_program() {
        let Some(sandbox) = sandbox().await else { return };
        let result = sandbox.execute("def f(): return 1\nprint(f())", None, &[]).await;
        assert!(result.compiled);
        assert!(result.output.contains('1'));
        assert_eq!(result.error, "");
        assert!(result.succeeded());
    }

    #[tokio::test]
    async fn syntax_error_is_not_compiled() {
        let Some(sandbox) = sandbox().await else { return };
        let result = sandbox.execute("def f(:", None, &[]).await;
        assert!(!result.compiled);
        assert!(result.error.starts_with("Syntax Error:"));
        assert!(result.output.is_empty());
    }

    #[tokio::test]
    async fn runtime_fault_keeps_earlier_output() {
        let Some(sandbox) = sandbox().await else { return };
        let result = sandbox
            .execute("print('before')\nraise ValueError('bad value')\nprint('after')", None, &[])
            .await;
        assert!(result.compiled);
        assert_eq!(result.output, "before\n");
        assert!(result.error.starts_with("Runtime Error: bad value"));
        assert!(result.error.contains("Traceback"));
    }

    #[tokio::test]
    async fn fenced_and_escaped_sources_are_sanitized() {
        let Some(sandbox) = sandbox().await else { return };
        let result = sandbox.execute("\"```python\\nprint(2 + 3)\\n```\"", None, &[]).await;
        assert_eq!(result.source_code, "print(2 + 3)");
        assert_eq!(result.output.trim(), "5");
    }

    #[tokio::test]
    async fn missing_dependency_becomes_a_warning() {
        let Some(sandbox) = sandbox().await else { return };
        let result = sandbox
            .execute("import surely_not_a_real_module_xyz\n", None, &[])
            .await;
        assert!(result.compiled);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("surely_not_a_real_module_xyz"));
        assert!(result.error.starts_with("Runtime Error:"));
    }

    #[tokio::test]
    async fn attachments_and_artifacts_reach_result_dir() {
        let Some(sandbox) = sandbox().await else { return };
        let inputs = tempfile::tempdir().expect("tempdir");
        let results = tempfile::tempdir().expect("tempdir");
        let attachment = inputs.path().join("numbers.txt");
        std::fs::write(&attachment, "1\n2\n3\n").unwrap();

        let code = "\
with open(attachments['numbers.txt']) as f:
    total = sum(int(line) for line in f)
print(total)
with open('chart.svg', 'w') as f:
    f.write('<svg/>')
";
        let result = sandbox
            .execute(code, Some(results.path()), &[attachment])
            .await;

        assert_eq!(result.error, "");
        assert_eq!(result.output.trim(), "6");
        assert!(results.path().join("chart.svg").exists());
        assert!(results.path().join("numbers.txt").exists());
        assert_eq!(result.artifacts.len(), 2);
    }

    #[tokio::test]
    async fn infinite_loop_times_out_as_compiled() {
        if !python_available("python3").await {
            return;
        }
        let sandbox = Sandbox::new(SandboxConfig {
            exec_timeout: Duration::from_secs(1),
            auto_install: false,
            ..SandboxConfig::default()
        });
        let result = sandbox.execute("while True:\n    pass", None, &[]).await;
        assert!(result.compiled);
        assert_eq!(result.error, "Execution timed out after 1s");
    }
}
