//! File-addressable task workspace.
//!
//! Every task lives in one directory under the configured root whose name
//! contains the task id (`<taskId>_<label>`). Subtask descriptors sit at the
//! task root as `*.json`; everything derived from them (sources, run results,
//! test results, execution artifacts) goes into the results subfolder.
//!
//! ## Resolution
//!
//! Task folders may be created by another process moments before they are
//! needed, so [`TaskWorkspace::resolve`] re-lists the root with exponential
//! backoff before reporting [`WorkspaceError::NotFound`].

mod language;
mod naming;
mod types;

pub use language::{LanguageRule, LanguageRules, RuleScope, DEFAULT_EXTENSION};
pub use naming::{order_key, task_label, ORIGINAL_REQUIREMENTS_FILE};
pub use types::{all_passed, Attachment, RunResult, Subtask, SubtaskDescriptor, TestResult};

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde_json::Value;

use crate::config::WorkspaceConfig;
use crate::error::{WorkspaceError, WorkspaceResult};
use crate::parser::{self, ParseOutcome};
use crate::util::unique_path;

const HINT_PREFIX: &str = "Consider the possible error:";

/// Upper bound for a single wait between resolve attempts.
const MAX_RESOLVE_DELAY: Duration = Duration::from_secs(60);

// ─────────────────────────────────────────────────────────────────────────────
// TaskWorkspace
// ─────────────────────────────────────────────────────────────────────────────

/// Store for task directories and their artifacts.
#[derive(Debug, Clone)]
pub struct TaskWorkspace {
    config: WorkspaceConfig,
    languages: LanguageRules,
}

impl TaskWorkspace {
    pub fn new(config: WorkspaceConfig) -> Self {
        Self {
            config,
            languages: LanguageRules::default(),
        }
    }

    /// Replace the language detection table.
    pub fn with_language_rules(mut self, languages: LanguageRules) -> Self {
        self.languages = languages;
        self
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn languages(&self) -> &LanguageRules {
        &self.languages
    }

    /// Find the directory for `task_id`, retrying with exponential backoff.
    ///
    /// When several directories match, the most recently modified one wins.
    pub async fn resolve(&self, task_id: &str) -> WorkspaceResult<PathBuf> {
        let attempts = self.config.resolve_attempts.max(1);

        for attempt in 1..=attempts {
            match self.scan_root(task_id).await {
                Ok(Some(dir)) => {
                    tracing::debug!(task_id, attempt, path = %dir.display(), "Found task folder");
                    return Ok(dir);
                }
                Ok(None) => {
                    tracing::warn!(task_id, attempt, attempts, "Task folder not found");
                }
                Err(e) => {
                    tracing::warn!(task_id, attempt, attempts, error = %e, "Failed to list task root");
                }
            }

            if attempt < attempts {
                let delay = resolve_delay(self.config.resolve_base_delay, attempt);
                tracing::debug!(task_id, delay_ms = delay.as_millis() as u64, "Waiting before retry");
                tokio::time::sleep(delay).await;
            }
        }

        tracing::error!(task_id, attempts, "Failed to find task folder");
        Err(WorkspaceError::NotFound {
            task_id: task_id.to_string(),
            attempts,
        })
    }

    async fn scan_root(&self, task_id: &str) -> std::io::Result<Option<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.config.root).await?;
        let mut best: Option<(SystemTime, PathBuf)> = None;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_name().to_string_lossy().contains(task_id) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_dir() {
                tracing::warn!(path = %entry.path().display(), "Matching entry is not a directory");
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            if best.as_ref().map_or(true, |(t, _)| modified > *t) {
                best = Some((modified, entry.path()));
            }
        }

        Ok(best.map(|(_, path)| path))
    }

    /// Create `<taskId>_<label>` under the root. Idempotent.
    pub async fn create(&self, task_id: &str, label: &str) -> WorkspaceResult<PathBuf> {
        let dir = self.config.root.join(naming::task_folder(task_id, label));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| WorkspaceError::io(&dir, e))?;
        tracing::info!(task_id, path = %dir.display(), "Task folder ready");
        Ok(dir)
    }

    /// Create a task folder with its original requirements and descriptors.
    ///
    /// Descriptors are written as `<taskName>_<n>.json` with `n` from 1, so
    /// their order survives a later [`list_subtasks`](Self::list_subtasks).
    /// Without an explicit label one is derived from the current time and the
    /// first words of `original_text`.
    pub async fn create_task(
        &self,
        task_id: &str,
        original_text: &str,
        label: Option<&str>,
        descriptors: &[SubtaskDescriptor],
    ) -> WorkspaceResult<PathBuf> {
        let label = match label {
            Some(label) => label.to_string(),
            None => task_label(original_text, &chrono::Local::now()),
        };
        let dir = self.create(task_id, &label).await?;

        let requirements = dir.join(ORIGINAL_REQUIREMENTS_FILE);
        tokio::fs::write(&requirements, original_text)
            .await
            .map_err(|e| WorkspaceError::io(&requirements, e))?;

        for (i, descriptor) in descriptors.iter().enumerate() {
            let path = dir.join(naming::descriptor_file(&descriptor.task_name, i + 1));
            write_json(&path, descriptor).await?;
        }

        tracing::info!(task_id, subtasks = descriptors.len(), "Created task");
        Ok(dir)
    }

    /// Descriptors at the task root, ordered by their numeric suffix and then by name.
    ///
    /// Files that are not valid descriptors are skipped with a warning.
    pub async fn list_subtasks(&self, task_id: &str) -> WorkspaceResult<Vec<Subtask>> {
        let dir = self.resolve(task_id).await?;
        let mut subtasks = Vec::new();

        for path in descriptor_files(&dir).await? {
            match read_descriptor(&path).await {
                Ok(descriptor) => subtasks.push((path, descriptor)),
                Err(e) => tracing::warn!(task_id, error = %e, "Skipping subtask file"),
            }
        }

        let subtasks: Vec<Subtask> = subtasks
            .into_iter()
            .enumerate()
            .map(|(index, (path, descriptor))| Subtask {
                index,
                order: file_name(&path).and_then(order_key),
                path,
                descriptor,
            })
            .collect();

        if subtasks.is_empty() {
            tracing::warn!(task_id, "No subtask descriptors found");
        }
        Ok(subtasks)
    }

    /// Append `Consider the possible error: <text>` to every descriptor once.
    ///
    /// Descriptors already containing the hint are left untouched; other
    /// fields, known or not, are preserved. Returns the updated subtasks.
    pub async fn append_hint(&self, task_id: &str, text: &str) -> WorkspaceResult<Vec<Subtask>> {
        let text = text.trim();
        if text.is_empty() {
            tracing::info!(task_id, "Empty hint, skipping subtask updates");
            return self.list_subtasks(task_id).await;
        }

        let dir = self.resolve(task_id).await?;
        let hint = format!("{} {}", HINT_PREFIX, text);

        for path in descriptor_files(&dir).await? {
            let mut value = match read_json_value(&path).await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(task_id, error = %e, "Skipping unreadable subtask file");
                    continue;
                }
            };
            let Some(Value::String(description)) = value.get_mut("taskDescription") else {
                tracing::warn!(path = %path.display(), "Subtask missing string taskDescription; skipping hint");
                continue;
            };
            if description.contains(&hint) {
                continue;
            }
            if !description.is_empty() && !description.ends_with(char::is_whitespace) {
                description.push(' ');
            }
            description.push_str(&hint);
            write_json(&path, &value).await?;
            tracing::info!(path = %path.display(), "Appended error hint to subtask");
        }

        self.list_subtasks(task_id).await
    }

    /// Results folder for a task, created if missing.
    pub async fn results_dir(&self, task_id: &str) -> WorkspaceResult<PathBuf> {
        let dir = self.resolve(task_id).await?.join(&self.config.results_folder);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| WorkspaceError::io(&dir, e))?;
        Ok(dir)
    }

    /// Delete everything inside the results folder, keeping the folder itself.
    pub async fn clear_artifacts(&self, task_id: &str) -> WorkspaceResult<()> {
        let dir = self.resolve(task_id).await?.join(&self.config.results_folder);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(task_id, "No results folder to clear");
                return Ok(());
            }
            Err(e) => return Err(WorkspaceError::io(&dir, e)),
        };

        let mut removed = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| WorkspaceError::io(&dir, e))?
        {
            let path = entry.path();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            let result = if is_dir {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(WorkspaceError::io(&path, e)),
            }
        }

        tracing::info!(task_id, removed, "Cleared result artifacts");
        Ok(())
    }

    /// Parse a code-generation response and store one file per source unit.
    ///
    /// When nothing structured can be recovered, the raw response is stored
    /// as the whole-program unit. Existing files are never overwritten.
    pub async fn save_source_units(
        &self,
        task_id: &str,
        subtask_index: usize,
        raw_output: &str,
    ) -> WorkspaceResult<Vec<PathBuf>> {
        let dir = self.results_dir(task_id).await?;
        let mut saved = Vec::new();

        match parser::parse_source_units(raw_output) {
            ParseOutcome::Structured(units) => {
                for unit in units {
                    let stem = naming::fragment_stem(&unit.name, subtask_index, unit.completion_order);
                    let ext = self.languages.detect(&unit.code);
                    let path = if unit.is_whole_program() {
                        next_whole_source_path(&dir, subtask_index, ext).await?
                    } else {
                        unique_path(&dir, &stem, ext)
                    };
                    write_text(&path, &unit.code).await?;
                    tracing::info!(task_id, subtask_index, unit = %unit.name, path = %path.display(), "Saved source unit");
                    saved.push(path);
                }
            }
            ParseOutcome::Unstructured { raw, cleaned } => {
                let ext = self.languages.detect(&cleaned);
                let path = next_whole_source_path(&dir, subtask_index, ext).await?;
                write_text(&path, &raw).await?;
                tracing::info!(task_id, subtask_index, path = %path.display(), "Saved raw output as whole source");
                saved.push(path);
            }
        }

        Ok(saved)
    }

    /// Path of the most recently saved whole-program source for a subtask.
    pub async fn latest_whole_source(
        &self,
        task_id: &str,
        subtask_index: usize,
    ) -> WorkspaceResult<Option<PathBuf>> {
        let dir = self.resolve(task_id).await?.join(&self.config.results_folder);
        Ok(whole_source_files(&dir, subtask_index).await?.pop().map(|(_, path)| path))
    }

    /// The most recently saved whole-program source for a subtask.
    pub async fn read_whole_source(
        &self,
        task_id: &str,
        subtask_index: usize,
    ) -> WorkspaceResult<Option<String>> {
        match self.latest_whole_source(task_id, subtask_index).await? {
            Some(path) => {
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| WorkspaceError::io(&path, e))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    /// Write `Run result_subtask_<i>.json`, replacing an earlier one.
    pub async fn save_run_result(
        &self,
        task_id: &str,
        subtask_index: usize,
        result: &RunResult,
    ) -> WorkspaceResult<PathBuf> {
        let path = self
            .results_dir(task_id)
            .await?
            .join(naming::run_result_file(subtask_index));
        write_json(&path, result).await?;
        tracing::info!(task_id, subtask_index, compiled = result.compiled, "Saved run result");
        Ok(path)
    }

    /// Write `<Passed|Failed> Test result_subtask_<i>_test_<j>.json`.
    ///
    /// A result with the opposite marker for the same case is removed so each
    /// case has a single file.
    pub async fn save_test_result(
        &self,
        task_id: &str,
        subtask_index: usize,
        case_index: usize,
        result: &TestResult,
    ) -> WorkspaceResult<PathBuf> {
        let dir = self.results_dir(task_id).await?;
        let passed = result.is_test_passed;
        let stale = dir.join(naming::test_result_file(subtask_index, case_index, !passed));
        match tokio::fs::remove_file(&stale).await {
            Ok(()) => tracing::debug!(path = %stale.display(), "Removed stale test result"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(WorkspaceError::io(&stale, e)),
        }

        let path = dir.join(naming::test_result_file(subtask_index, case_index, passed));
        write_json(&path, result).await?;
        Ok(path)
    }

    /// Attachment paths of a subtask that exist on disk.
    ///
    /// Relative paths are resolved against the task directory; missing files
    /// are skipped with a warning.
    pub async fn resolve_attachments(&self, task_id: &str, subtask: &Subtask) -> WorkspaceResult<Vec<PathBuf>> {
        let declared = subtask.descriptor.attachment_paths();
        if declared.is_empty() {
            return Ok(Vec::new());
        }

        let dir = self.resolve(task_id).await?;
        let mut found = Vec::new();
        for raw in declared {
            let candidate = Path::new(raw.trim());
            let path = if candidate.is_absolute() {
                candidate.to_path_buf()
            } else {
                dir.join(candidate)
            };
            if tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
                found.push(path);
            } else {
                tracing::warn!(task_id, path = %path.display(), "Attachment not found");
            }
        }
        Ok(found)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// File helpers
// ─────────────────────────────────────────────────────────────────────────────

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Wait before the next resolve attempt: `base * 2^(attempt - 1)`, capped.
fn resolve_delay(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_RESOLVE_DELAY, |delay| delay.min(MAX_RESOLVE_DELAY))
}

/// Whole-program files for a subtask as `(generation, path)`, oldest first.
async fn whole_source_files(dir: &Path, subtask_index: usize) -> WorkspaceResult<Vec<(u32, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(WorkspaceError::io(dir, e)),
    };

    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| WorkspaceError::io(dir, e))?
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(generation) = naming::whole_source_generation(&name, subtask_index) {
            found.push((generation, entry.path()));
        }
    }
    found.sort();
    Ok(found)
}

/// Next free whole-program path; the collision suffix counts across extensions
/// so the newest file is always the one with the highest suffix.
async fn next_whole_source_path(dir: &Path, subtask_index: usize, ext: &str) -> WorkspaceResult<PathBuf> {
    let stem = naming::whole_source_stem(subtask_index);
    let name = match whole_source_files(dir, subtask_index).await?.last() {
        None => format!("{}.{}", stem, ext),
        Some((generation, _)) => format!("{}_{}.{}", stem, generation + 1, ext),
    };
    Ok(dir.join(name))
}

/// `*.json` files directly under `dir`, sorted by order key then name.
async fn descriptor_files(dir: &Path) -> WorkspaceResult<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| WorkspaceError::io(dir, e))?;
    let mut files = Vec::new();

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| WorkspaceError::io(dir, e))?
    {
        let path = entry.path();
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
        if is_json && is_file {
            files.push(path);
        }
    }

    files.sort_by(|a, b| {
        let key = |p: &PathBuf| {
            let name = file_name(p).unwrap_or_default().to_string();
            (order_key(&name).unwrap_or(u64::MAX), name)
        };
        key(a).cmp(&key(b))
    });
    Ok(files)
}

async fn read_json_value(path: &Path) -> WorkspaceResult<Value> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| WorkspaceError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| WorkspaceError::json(path, e))
}

async fn read_descriptor(path: &Path) -> WorkspaceResult<SubtaskDescriptor> {
    let value = read_json_value(path).await?;
    let missing: Vec<&str> = ["taskName", "taskDescription"]
        .into_iter()
        .filter(|key| value.get(key).is_none())
        .collect();
    if !missing.is_empty() {
        return Err(WorkspaceError::InvalidDescriptor {
            path: path.to_path_buf(),
            reason: format!("missing {}", missing.join(", ")),
        });
    }
    serde_json::from_value(value).map_err(|e| WorkspaceError::InvalidDescriptor {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> WorkspaceResult<()> {
    let text = serde_json::to_string_pretty(value).map_err(|e| WorkspaceError::json(path, e))?;
    write_text(path, &text).await
}

async fn write_text(path: &Path, text: &str) -> WorkspaceResult<()> {
    tokio::fs::write(path, text)
        .await
        .map_err(|e| WorkspaceError::io(path, e))
}
