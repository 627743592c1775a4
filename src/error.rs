//! Error types surfaced by the task workspace and the pipeline around it.
//!
//! Sandbox and test failures are never raised: they are folded into
//! [`RunResult`](crate::workspace::RunResult) and
//! [`TestResult`](crate::workspace::TestResult) values instead.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The workspace root is missing or no directory matched the task id
    /// after every resolution attempt.
    #[error("No folder found containing taskId: {task_id} after {attempts} attempts")]
    NotFound { task_id: String, attempts: u32 },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid subtask descriptor {path}: {reason}")]
    InvalidDescriptor { path: PathBuf, reason: String },
}

impl WorkspaceError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// Whether this is the retry-exhausted "task folder absent" case.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

/// Failure of a whole-task operation.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error("No subtasks found for taskId: {0}")]
    NoSubtasks(String),

    #[error("No completion endpoint configured (set COMPLETION_API_KEY)")]
    CompletionUnavailable,

    #[error("Completion for subtask {subtask_index} failed: {source}")]
    Completion {
        subtask_index: usize,
        #[source]
        source: crate::llm::LlmError,
    },
}
