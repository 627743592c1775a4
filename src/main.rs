//! artifact-pipeline - command line entry point
//!
//! Every subcommand prints its result as pretty JSON on stdout; logs go to stderr.

use std::path::PathBuf;

use anyhow::Context;
use artifact_pipeline::{
    config::Config,
    pipeline::Pipeline,
    workspace::SubtaskDescriptor,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Task artifact pipeline: workspace, sandboxed execution and test synthesis
#[derive(Parser, Debug)]
#[command(name = "artifact-pipeline")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a task folder with its requirements and subtask descriptors
    Create {
        /// Task id; a random UUID when absent
        #[arg(long)]
        task_id: Option<String>,

        /// File holding the original requirements text
        #[arg(long, value_name = "PATH")]
        requirements: PathBuf,

        /// JSON array of {taskName, taskDescription} objects; split by the model (or heuristically) when absent
        #[arg(long, value_name = "PATH")]
        descriptors: Option<PathBuf>,

        /// Folder label; chosen by the model (or derived from the requirements) when absent
        #[arg(long)]
        label: Option<String>,
    },

    /// List a task's subtasks in processing order
    Subtasks { task_id: String },

    /// Append an error hint to every subtask description
    Hint { task_id: String, text: String },

    /// Empty the task's result artifacts folder
    Clear { task_id: String },

    /// Store a model response as source units (reads stdin without --file)
    SaveSource {
        task_id: String,
        subtask_index: usize,
        #[arg(long, value_name = "PATH")]
        file: Option<PathBuf>,
    },

    /// Execute a source file in the sandbox
    Execute {
        file: PathBuf,

        /// Copy artifacts here
        #[arg(long, value_name = "DIR")]
        result_dir: Option<PathBuf>,

        #[arg(long = "attachment", value_name = "PATH")]
        attachments: Vec<PathBuf>,
    },

    /// Generate and run tests for a source file
    Test {
        file: PathBuf,

        #[arg(long = "attachment", value_name = "PATH")]
        attachments: Vec<PathBuf>,

        #[arg(long)]
        model_assist: bool,
    },

    /// Execute and test every subtask of a task
    Run {
        task_id: String,
        #[arg(long)]
        model_assist: bool,
    },

    /// Generate sources for every subtask with the completion endpoint
    Generate {
        task_id: String,

        /// Validation payload ({"results": [{"error": ...}]}) from a previous run
        #[arg(long, value_name = "JSON")]
        validation: Option<String>,
    },
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn read_input(file: Option<&PathBuf>) -> anyhow::Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut text = String::new();
            tokio::io::stdin().read_to_string(&mut text).await?;
            Ok(text)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "artifact_pipeline=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    tracing::debug!(root = %config.workspace.root.display(), "Loaded configuration");
    let pipeline = Pipeline::new(config);
    let workspace = pipeline.workspace();

    match cli.command {
        Command::Create {
            task_id,
            requirements,
            descriptors,
            label,
        } => {
            let task_id = task_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let original = read_input(Some(&requirements)).await?;
            let descriptors: Option<Vec<SubtaskDescriptor>> = match descriptors {
                Some(path) => Some(
                    serde_json::from_str(&read_input(Some(&path)).await?)
                        .context("Descriptors must be a JSON array of subtask objects")?,
                ),
                None => None,
            };
            let created = pipeline
                .create_task(&task_id, &original, label.as_deref(), descriptors)
                .await?;
            print_json(&created)?;
        }
        Command::Subtasks { task_id } => {
            let subtasks = workspace.list_subtasks(&task_id).await?;
            let listed: Vec<Value> = subtasks
                .iter()
                .map(|s| {
                    json!({
                        "index": s.index,
                        "order": s.order,
                        "path": s.path,
                        "descriptor": s.descriptor,
                    })
                })
                .collect();
            print_json(&listed)?;
        }
        Command::Hint { task_id, text } => {
            let subtasks = workspace.append_hint(&task_id, &text).await?;
            let descriptors: Vec<_> = subtasks.iter().map(|s| &s.descriptor).collect();
            print_json(&descriptors)?;
        }
        Command::Clear { task_id } => {
            workspace.clear_artifacts(&task_id).await?;
            print_json(&json!({ "taskId": task_id, "cleared": true }))?;
        }
        Command::SaveSource {
            task_id,
            subtask_index,
            file,
        } => {
            let raw = read_input(file.as_ref()).await?;
            let saved = workspace
                .save_source_units(&task_id, subtask_index, &raw)
                .await?;
            print_json(&saved)?;
        }
        Command::Execute {
            file,
            result_dir,
            attachments,
        } => {
            let source = read_input(Some(&file)).await?;
            let result = pipeline
                .sandbox()
                .execute(&source, result_dir.as_deref(), &attachments)
                .await;
            print_json(&result)?;
        }
        Command::Test {
            file,
            attachments,
            model_assist,
        } => {
            let source = read_input(Some(&file)).await?;
            let results = pipeline
                .tester()
                .generate_and_run(&source, &attachments, model_assist)
                .await;
            print_json(&json!({
                "allTestsPassed": artifact_pipeline::workspace::all_passed(&results),
                "testResults": results,
            }))?;
        }
        Command::Run {
            task_id,
            model_assist,
        } => {
            let report = pipeline.run_task(&task_id, model_assist).await?;
            print_json(&report)?;
        }
        Command::Generate {
            task_id,
            validation,
        } => {
            let validation = validation.map(Value::String);
            let report = pipeline
                .generate_sources(&task_id, validation.as_ref())
                .await?;
            print_json(&report)?;
        }
    }

    Ok(())
}
