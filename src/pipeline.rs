//! Whole-task flows: task splitting, source generation and the run/test loop.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::error::PipelineError;
use crate::llm::{ChatCompletionsClient, CompletionClient};
use crate::parser::recover_json;
use crate::publish::{self, ArtifactPublisher};
use crate::sandbox::Sandbox;
use crate::tester::TestSynthesizer;
use crate::workspace::{all_passed, task_label, RunResult, SubtaskDescriptor, TaskWorkspace, TestResult};

const CODEGEN_SYSTEM_PROMPT: &str = "You are a programming assistant. \
Reply with complete, runnable code only, without explanations outside the code. \
Comments inside the code are fine. Consider edge cases. \
The task arrives as a JSON object: {\"taskName\": \"<name>\", \"taskDescription\": \"<description>\"}. \
The reply is passed to the interpreter as is.";

const SPLIT_SYSTEM_PROMPT: &str = "You are a project manager. \
Split raw requirements into small, well-defined implementation subtasks that another \
programming assistant can complete one at a time. Reply with JSON only.";

const SPLIT_PROMPT: &str = "Split the following raw technical task description into a list of \
small, well-defined implementation tasks. For each task give taskName (short string) and \
taskDescription (detailed). Return ONLY valid JSON with the shape: \
{\"tasks\": [{\"taskName\": \"...\", \"taskDescription\": \"...\"}]}.\n\nRaw text:\n";

const LABEL_SYSTEM_PROMPT: &str = "You are a copywriter who names folders. Reply with the name only.";

const LABEL_PROMPT: &str = "Given the following task description, generate a SHORT folder name \
(3-5 words max, lowercase, no special chars except underscores). Use only letters, numbers, \
and underscores. No spaces. Example: 'build_api_endpoint' or 'fix_auth_bug'.\n\nTask: ";

const SPLIT_MAX_WORDS: usize = 50;
const SPLIT_TITLE_CHARS: usize = 80;
const LABEL_MAX_CHARS: usize = 50;

/// Group sentences into descriptors of at most ~50 words each.
///
/// Sentences end at `.` or a line break. The first sentence of a group,
/// cut to 80 characters, becomes the task name.
pub fn split_heuristically(text: &str) -> Vec<SubtaskDescriptor> {
    let sentences = text
        .split(['.', '\n', '\r'])
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let mut groups: Vec<Vec<&str>> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut words = 0;
    for sentence in sentences {
        let count = sentence.split_whitespace().count();
        if words + count > SPLIT_MAX_WORDS && !current.is_empty() {
            groups.push(std::mem::take(&mut current));
            words = 0;
        }
        current.push(sentence);
        words += count;
    }
    if !current.is_empty() {
        groups.push(current);
    }

    groups
        .into_iter()
        .map(|group| {
            let name: String = group[0].chars().take(SPLIT_TITLE_CHARS).collect();
            SubtaskDescriptor::new(name, group.join(" "))
        })
        .collect()
}

/// Ask `client` to split `text` into subtasks.
///
/// Accepts `{"tasks": [...]}` or a bare array; items may use
/// `taskName`/`taskDescription` or `title`/`description`. Falls back to
/// [`split_heuristically`] when the call fails or nothing usable comes back.
pub async fn split_with_model(client: &dyn CompletionClient, text: &str) -> Vec<SubtaskDescriptor> {
    let prompt = format!("{}{}", SPLIT_PROMPT, text);
    let descriptors = match client.complete(SPLIT_SYSTEM_PROMPT, &prompt).await {
        Ok(reply) => match recover_json(&reply) {
            Ok(value) => descriptors_from_model(&value),
            Err(e) => {
                tracing::warn!(error = %e, "Unparsable subtask list from model");
                Vec::new()
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "Model-assisted split failed");
            Vec::new()
        }
    };

    if descriptors.is_empty() {
        tracing::info!("Falling back to heuristic split");
        return split_heuristically(text);
    }
    tracing::info!(subtasks = descriptors.len(), "Model split requirements");
    descriptors
}

fn descriptors_from_model(value: &Value) -> Vec<SubtaskDescriptor> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => match map.get("tasks").or_else(|| map.get("subtasks")) {
            Some(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .iter()
        .filter_map(|item| {
            if let Ok(descriptor) = serde_json::from_value::<SubtaskDescriptor>(item.clone()) {
                return Some(descriptor);
            }
            let description = item
                .get("description")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|d| !d.is_empty())?;
            let name = item
                .get("title")
                .or_else(|| item.get("name"))
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .unwrap_or(description);
            Some(SubtaskDescriptor::new(
                name.chars().take(SPLIT_TITLE_CHARS).collect::<String>(),
                description,
            ))
        })
        .collect()
}

/// Folder label `<timestamp>_<model-chosen name>`.
///
/// The reply is lowercased and reduced to letters, digits and underscores;
/// when the call fails the label is derived from the text as usual.
pub async fn label_with_model(client: &dyn CompletionClient, text: &str) -> String {
    let now = chrono::Local::now();
    let prompt = format!("{}{}", LABEL_PROMPT, text);
    match client.complete(LABEL_SYSTEM_PROMPT, &prompt).await {
        Ok(reply) => {
            let mut name: String = reply
                .trim()
                .to_lowercase()
                .chars()
                .filter(|c| c.is_alphanumeric() || *c == '_')
                .take(LABEL_MAX_CHARS)
                .collect();
            if name.is_empty() {
                name = "task".to_string();
            }
            format!("{}_{}", now.format("%Y-%m-%d_%H-%M-%S"), name)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Model folder label failed, deriving from text");
            task_label(text, &now)
        }
    }
}

/// First validation error in a `{"results": [{"error": ...}]}` payload.
///
/// String payloads are parsed first; Python-style single-quoted dicts are
/// accepted too. Blank errors count as absent.
pub fn extract_validation_error(payload: &Value) -> Option<String> {
    let parsed;
    let payload = match payload {
        Value::String(text) => {
            parsed = parse_payload_text(text)?;
            &parsed
        }
        other => other,
    };

    payload
        .get("results")?
        .as_array()?
        .first()?
        .get("error")?
        .as_str()
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(str::to_string)
}

fn parse_payload_text(text: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }
    let value = recover_json(text).ok().filter(Value::is_object);
    if value.is_some() || text.contains('"') {
        return value;
    }
    serde_json::from_str(&text.replace('\'', "\"")).ok()
}

/// Outcome of [`Pipeline::create_task`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedTask {
    pub task_id: String,
    pub path: PathBuf,
    pub subtasks: Vec<SubtaskDescriptor>,
}

/// One subtask sent for code generation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedSubtask {
    pub subtask_index: usize,
    pub task_name: String,
    pub task_description: String,
    pub saved: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationReport {
    pub task_id: String,
    pub total_subtasks: usize,
    /// Hint appended to the descriptors before generation, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
    pub results: Vec<GeneratedSubtask>,
}

/// Execution and test outcome for one subtask.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskRun {
    pub subtask_index: usize,
    pub task_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_result: Option<RunResult>,
    pub test_results: Vec<TestResult>,
    /// Why the subtask was not executed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

impl SubtaskRun {
    fn passed(&self) -> bool {
        self.run_result.as_ref().is_some_and(RunResult::succeeded) && all_passed(&self.test_results)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRunReport {
    pub task_id: String,
    pub subtasks: Vec<SubtaskRun>,
    /// Every subtask ran cleanly and every generated test passed.
    pub all_tests_passed: bool,
}

/// Workspace, sandbox, tester and collaborators wired together.
pub struct Pipeline {
    workspace: TaskWorkspace,
    sandbox: Sandbox,
    tester: TestSynthesizer,
    client: Option<Arc<dyn CompletionClient>>,
    publisher: Arc<dyn ArtifactPublisher>,
}

impl Pipeline {
    /// Build every component from `config`.
    ///
    /// The completion client exists only when an API key is configured; the
    /// publisher is a no-op unless auto-push is enabled.
    pub fn new(config: Config) -> Self {
        let client = ChatCompletionsClient::from_config(&config.completion)
            .map(|c| Arc::new(c) as Arc<dyn CompletionClient>);
        let publisher = publish::from_config(&config.publish);
        Self::with_parts(config, client, publisher)
    }

    pub fn with_parts(
        config: Config,
        client: Option<Arc<dyn CompletionClient>>,
        publisher: Arc<dyn ArtifactPublisher>,
    ) -> Self {
        let sandbox = Sandbox::new(config.sandbox);
        let tester = TestSynthesizer::new(sandbox.clone(), client.clone());
        Self {
            workspace: TaskWorkspace::new(config.workspace),
            sandbox,
            tester,
            client,
            publisher,
        }
    }

    pub fn workspace(&self) -> &TaskWorkspace {
        &self.workspace
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn tester(&self) -> &TestSynthesizer {
        &self.tester
    }

    /// Create a task folder from requirements text.
    ///
    /// Explicit `descriptors` and `label` win. Otherwise the completion
    /// collaborator splits and names the task when configured, and the
    /// heuristics do so when it is not.
    pub async fn create_task(
        &self,
        task_id: &str,
        original_text: &str,
        label: Option<&str>,
        descriptors: Option<Vec<SubtaskDescriptor>>,
    ) -> Result<CreatedTask, PipelineError> {
        let descriptors = match (descriptors, &self.client) {
            (Some(descriptors), _) => descriptors,
            (None, Some(client)) => split_with_model(client.as_ref(), original_text).await,
            (None, None) => split_heuristically(original_text),
        };
        let label = match (label, &self.client) {
            (Some(label), _) => Some(label.to_string()),
            (None, Some(client)) => Some(label_with_model(client.as_ref(), original_text).await),
            (None, None) => None,
        };

        let path = self
            .workspace
            .create_task(task_id, original_text, label.as_deref(), &descriptors)
            .await?;
        Ok(CreatedTask {
            task_id: task_id.to_string(),
            path,
            subtasks: descriptors,
        })
    }

    /// Ask the completion collaborator for code for every subtask and store it.
    ///
    /// A validation error found in `validation` clears the results folder and
    /// is appended to every descriptor as a hint before generation starts.
    pub async fn generate_sources(
        &self,
        task_id: &str,
        validation: Option<&Value>,
    ) -> Result<GenerationReport, PipelineError> {
        let client = self
            .client
            .as_ref()
            .ok_or(PipelineError::CompletionUnavailable)?;

        let mut subtasks = self.workspace.list_subtasks(task_id).await?;
        if subtasks.is_empty() {
            return Err(PipelineError::NoSubtasks(task_id.to_string()));
        }

        let validation_error = validation.and_then(extract_validation_error);
        if let Some(error) = &validation_error {
            tracing::info!(task_id, error = %error, "Regenerating with validation error hint");
            self.workspace.clear_artifacts(task_id).await?;
            subtasks = self.workspace.append_hint(task_id, error).await?;
        }

        let total = subtasks.len();
        let mut results = Vec::with_capacity(total);
        for subtask in subtasks {
            let descriptor = &subtask.descriptor;
            tracing::info!(
                task_id,
                subtask = subtask.index + 1,
                total,
                name = %descriptor.task_name,
                "Generating source"
            );

            let prompt = serde_json::to_string(descriptor)
                .unwrap_or_else(|_| descriptor.task_description.clone());
            let completion = client
                .complete(CODEGEN_SYSTEM_PROMPT, &prompt)
                .await
                .map_err(|source| PipelineError::Completion {
                    subtask_index: subtask.index,
                    source,
                })?;

            let saved = self
                .workspace
                .save_source_units(task_id, subtask.index, &completion)
                .await?;
            results.push(GeneratedSubtask {
                subtask_index: subtask.index,
                task_name: descriptor.task_name.clone(),
                task_description: descriptor.task_description.clone(),
                saved,
            });
        }

        Ok(GenerationReport {
            task_id: task_id.to_string(),
            total_subtasks: total,
            validation_error,
            results,
        })
    }

    /// Execute and test every subtask's whole-program source, in order.
    pub async fn run_task(
        &self,
        task_id: &str,
        use_model_assist: bool,
    ) -> Result<TaskRunReport, PipelineError> {
        let subtasks = self.workspace.list_subtasks(task_id).await?;
        if subtasks.is_empty() {
            return Err(PipelineError::NoSubtasks(task_id.to_string()));
        }
        let results_dir = self.workspace.results_dir(task_id).await?;

        let mut runs = Vec::with_capacity(subtasks.len());
        for subtask in &subtasks {
            let mut run = SubtaskRun {
                subtask_index: subtask.index,
                task_name: subtask.descriptor.task_name.clone(),
                run_result: None,
                test_results: Vec::new(),
                skipped: None,
            };

            let Some(source_path) = self.workspace.latest_whole_source(task_id, subtask.index).await? else {
                tracing::warn!(task_id, subtask_index = subtask.index, "No whole-program source, skipping");
                run.skipped = Some("No whole-program source saved".to_string());
                runs.push(run);
                continue;
            };
            let source = tokio::fs::read_to_string(&source_path)
                .await
                .map_err(|e| crate::error::WorkspaceError::io(&source_path, e))?;

            let attachments = self.workspace.resolve_attachments(task_id, subtask).await?;
            let result = self
                .sandbox
                .execute(&source, Some(&results_dir), &attachments)
                .await;
            self.workspace
                .save_run_result(task_id, subtask.index, &result)
                .await?;

            if result.succeeded() {
                self.publish_source(task_id, &source_path, &result.source_code).await;

                let tests = self
                    .tester
                    .generate_and_run(&result.source_code, &attachments, use_model_assist)
                    .await;
                for (case_index, test) in tests.iter().enumerate() {
                    self.workspace
                        .save_test_result(task_id, subtask.index, case_index, test)
                        .await?;
                }
                run.test_results = tests;
            } else {
                tracing::info!(task_id, subtask_index = subtask.index, "Run failed, tests skipped");
            }

            run.run_result = Some(result);
            runs.push(run);
        }

        let all_tests_passed = runs.iter().all(SubtaskRun::passed);
        tracing::info!(task_id, subtasks = runs.len(), all_tests_passed, "Task run finished");
        Ok(TaskRunReport {
            task_id: task_id.to_string(),
            subtasks: runs,
            all_tests_passed,
        })
    }

    async fn publish_source(&self, task_id: &str, source_path: &std::path::Path, code: &str) {
        let file_name = source_path
            .file_name()
            .map(|n| format!("{}_{}", task_id, n.to_string_lossy()))
            .unwrap_or_else(|| format!("{}_source.txt", task_id));
        if let Err(e) = self.publisher.publish(task_id, &file_name, code).await {
            tracing::warn!(task_id, file_name = %file_name, error = %e, "Publishing failed");
        }
    }
}
