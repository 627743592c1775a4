//! # Artifact Pipeline
//!
//! Turns model-generated code for a task into persisted, executed and tested
//! artifacts.
//!
//! ```text
//!   model output ──► parser ──► workspace (source units)
//!                                   │
//!                                   ▼
//!                               sandbox ──► run result + artifacts
//!                                   │
//!                                   ▼
//!                               tester  ──► test results
//! ```
//!
//! ## Modules
//! - `workspace`: task folders, subtask descriptors and every persisted artifact
//! - `parser`: tolerant recovery of source units from free-form model output
//! - `sandbox`: out-of-process execution with timeouts, resource caps and
//!   dependency resolution
//! - `tester`: test case synthesis and execution
//! - `llm`: text-completion collaborator
//! - `publish`: best-effort publishing of successful sources to git
//! - `pipeline`: whole-task generation and run flows

pub mod config;
pub mod error;
pub mod llm;
pub mod parser;
pub mod pipeline;
pub mod publish;
pub mod sandbox;
pub mod tester;
pub mod util;
pub mod workspace;

pub use config::Config;
pub use error::{PipelineError, WorkspaceError};
pub use pipeline::Pipeline;
