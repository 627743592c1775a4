//! Configuration management for the artifact pipeline.
//!
//! Configuration can be set via environment variables:
//! - `TASKS_ROOT` - Optional. Root directory holding one folder per task. Defaults to `/data/tasks`.
//! - `RESULT_ARTIFACTS_FOLDER` - Optional. Name of the derived-results subfolder. Defaults to `Result artifacts`.
//! - `RESOLVE_MAX_ATTEMPTS` - Optional. Attempts made to find a task folder. Defaults to `5`.
//! - `RESOLVE_BASE_DELAY_MS` - Optional. First backoff delay, doubled per attempt. Defaults to `1000`.
//! - `SANDBOX_PYTHON` - Optional. Interpreter used to run generated code. Defaults to `python3`.
//! - `SANDBOX_EXEC_TIMEOUT_SECS` - Optional. Wall-clock limit per execution. Defaults to `60`.
//! - `SANDBOX_INSTALL_TIMEOUT_SECS` - Optional. Limit per dependency install. Defaults to `120`.
//! - `SANDBOX_CASE_TIMEOUT_SECS` - Optional. Limit per generated test case. Defaults to `10`.
//! - `SANDBOX_AUTO_INSTALL` - Optional. Install missing imports on demand. Defaults to `true`.
//! - `SANDBOX_MEMORY_LIMIT_MB` - Optional. Address-space cap for executed code (Unix). Defaults to `0` (off);
//!   numeric stacks such as numpy/OpenBLAS reserve large virtual mappings and fail under tight caps.
//! - `SANDBOX_CPU_LIMIT_SECS` - Optional. CPU-time cap for executed code (Unix). Defaults to `60`.
//! - `SANDBOX_SCRATCH_ROOT` - Optional. Parent of per-run scratch directories. Defaults to the system temp dir.
//! - `COMPLETION_API_URL` - Optional. OpenAI-compatible chat completions endpoint.
//! - `COMPLETION_API_KEY` / `CEREBRAS_API_KEY` - Optional. Bearer token for the endpoint.
//! - `COMPLETION_MODEL` - Optional. Model identifier. Defaults to `llama-3.3-70b`.
//! - `COMPLETION_MAX_TOKENS` - Optional. Defaults to `1000`.
//! - `COMPLETION_TIMEOUT_SECS` - Optional. Per-request HTTP timeout. Defaults to `120`.
//! - `CODE_ARTIFACTS` - Optional. Git remote that receives successful sources.
//! - `ARTIFACTS_AUTO_PUSH` - Optional. Enables publishing to `CODE_ARTIFACTS`.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::util::env_var_bool;

pub const DEFAULT_TASKS_ROOT: &str = "/data/tasks";
pub const DEFAULT_RESULT_ARTIFACTS_FOLDER: &str = "Result artifacts";
pub const DEFAULT_COMPLETION_API_URL: &str = "https://api.cerebras.ai/v1/chat/completions";
pub const DEFAULT_COMPLETION_MODEL: &str = "llama-3.3-70b";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Task workspace layout and resolution behaviour.
#[derive(Debug, Clone)]
pub struct WorkspaceConfig {
    /// Directory containing one subdirectory per task
    pub root: PathBuf,

    /// Name of the derived-results subfolder inside a task directory
    pub results_folder: String,

    /// How many times `resolve` lists the root before giving up
    pub resolve_attempts: u32,

    /// Delay after the first failed attempt; doubled after each further one
    pub resolve_base_delay: Duration,
}

impl WorkspaceConfig {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            results_folder: DEFAULT_RESULT_ARTIFACTS_FOLDER.to_string(),
            resolve_attempts: 5,
            resolve_base_delay: Duration::from_secs(1),
        }
    }
}

/// Limits and interpreter settings for the execution sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Python interpreter used for syntax checks, execution and introspection
    pub python: String,

    /// Wall-clock limit for a single harness invocation
    pub exec_timeout: Duration,

    /// Limit for a single `pip install` attempt
    pub install_timeout: Duration,

    /// Limit for a single test case; a case that exceeds it fails on its own
    pub case_timeout: Duration,

    /// Whether missing imports trigger an install attempt
    pub auto_install: bool,

    /// Address-space cap applied through `ulimit -v` (Unix only, 0 disables)
    pub memory_limit_mb: u64,

    /// CPU-time cap applied through `ulimit -t` (Unix only, 0 disables)
    pub cpu_limit_secs: u64,

    /// Parent directory for scratch working directories (system temp when unset)
    pub scratch_root: Option<PathBuf>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            exec_timeout: Duration::from_secs(60),
            install_timeout: Duration::from_secs(120),
            case_timeout: Duration::from_secs(10),
            auto_install: true,
            memory_limit_mb: 0,
            cpu_limit_secs: 60,
            scratch_root: None,
        }
    }
}

/// Text-completion collaborator settings.
#[derive(Debug, Clone)]
pub struct CompletionConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,

    /// Timeout for a single HTTP request to the endpoint
    pub request_timeout: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_COMPLETION_API_URL.to_string(),
            api_key: None,
            model: DEFAULT_COMPLETION_MODEL.to_string(),
            max_tokens: 1000,
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl CompletionConfig {
    /// Check if a completion endpoint can be called (API key configured)
    pub fn is_enabled(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

/// Best-effort publishing of successful sources to a git remote.
#[derive(Debug, Clone, Default)]
pub struct PublishConfig {
    /// Remote URL (may embed credentials; masked in logs)
    pub remote: Option<String>,

    /// Publishing is skipped unless this is set
    pub auto_push: bool,
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: WorkspaceConfig,
    pub sandbox: SandboxConfig,
    pub completion: CompletionConfig,
    pub publish: PublishConfig,
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        _ => Ok(default),
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable cannot be parsed
    /// or `RESOLVE_MAX_ATTEMPTS` is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        let root = non_empty_env("TASKS_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TASKS_ROOT));

        let resolve_attempts: u32 = parse_env("RESOLVE_MAX_ATTEMPTS", 5)?;
        if resolve_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "RESOLVE_MAX_ATTEMPTS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let workspace = WorkspaceConfig {
            root,
            results_folder: non_empty_env("RESULT_ARTIFACTS_FOLDER")
                .unwrap_or_else(|| DEFAULT_RESULT_ARTIFACTS_FOLDER.to_string()),
            resolve_attempts,
            resolve_base_delay: Duration::from_millis(parse_env("RESOLVE_BASE_DELAY_MS", 1000)?),
        };

        let sandbox = SandboxConfig {
            python: non_empty_env("SANDBOX_PYTHON").unwrap_or_else(|| "python3".to_string()),
            exec_timeout: Duration::from_secs(parse_env("SANDBOX_EXEC_TIMEOUT_SECS", 60)?),
            install_timeout: Duration::from_secs(parse_env("SANDBOX_INSTALL_TIMEOUT_SECS", 120)?),
            case_timeout: Duration::from_secs(parse_env("SANDBOX_CASE_TIMEOUT_SECS", 10)?),
            auto_install: env_var_bool("SANDBOX_AUTO_INSTALL", true),
            memory_limit_mb: parse_env("SANDBOX_MEMORY_LIMIT_MB", 0)?,
            cpu_limit_secs: parse_env("SANDBOX_CPU_LIMIT_SECS", 60)?,
            scratch_root: non_empty_env("SANDBOX_SCRATCH_ROOT").map(PathBuf::from),
        };

        let completion = CompletionConfig {
            api_url: non_empty_env("COMPLETION_API_URL")
                .unwrap_or_else(|| DEFAULT_COMPLETION_API_URL.to_string()),
            api_key: non_empty_env("COMPLETION_API_KEY").or_else(|| non_empty_env("CEREBRAS_API_KEY")),
            model: non_empty_env("COMPLETION_MODEL")
                .unwrap_or_else(|| DEFAULT_COMPLETION_MODEL.to_string()),
            max_tokens: parse_env("COMPLETION_MAX_TOKENS", 1000)?,
            request_timeout: Duration::from_secs(parse_env("COMPLETION_TIMEOUT_SECS", 120)?),
        };

        let publish = PublishConfig {
            remote: non_empty_env("CODE_ARTIFACTS"),
            auto_push: env_var_bool("ARTIFACTS_AUTO_PUSH", false),
        };

        Ok(Self {
            workspace,
            sandbox,
            completion,
            publish,
        })
    }

    /// Create a config rooted at `root` with default settings (useful for testing).
    pub fn new(root: PathBuf) -> Self {
        Self {
            workspace: WorkspaceConfig::new(root),
            sandbox: SandboxConfig::default(),
            completion: CompletionConfig::default(),
            publish: PublishConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_uses_documented_defaults() {
        let config = Config::new(PathBuf::from("/tmp/tasks"));
        assert_eq!(config.workspace.root, PathBuf::from("/tmp/tasks"));
        assert_eq!(config.workspace.results_folder, "Result artifacts");
        assert_eq!(config.workspace.resolve_attempts, 5);
        assert_eq!(config.workspace.resolve_base_delay, Duration::from_secs(1));
        assert_eq!(config.sandbox.install_timeout, Duration::from_secs(120));
        assert_eq!(config.sandbox.memory_limit_mb, 0, "address-space cap is off by default");
        assert_eq!(config.completion.request_timeout, Duration::from_secs(120));
        assert!(!config.completion.is_enabled());
        assert!(!config.publish.auto_push);
    }

    #[test]
    fn blank_api_key_is_not_enabled() {
        let completion = CompletionConfig {
            api_key: Some("   ".to_string()),
            ..CompletionConfig::default()
        };
        assert!(!completion.is_enabled());
    }
}
