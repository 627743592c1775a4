//! Persisted artifact shapes.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Attachment reference(s) on a subtask descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Attachment {
    One(String),
    Many(Vec<String>),
}

impl Attachment {
    /// All non-blank attachment paths, in declaration order.
    pub fn paths(&self) -> Vec<&str> {
        let all: Vec<&str> = match self {
            Self::One(path) => vec![path.as_str()],
            Self::Many(paths) => paths.iter().map(String::as_str).collect(),
        };
        all.into_iter().filter(|p| !p.trim().is_empty()).collect()
    }
}

/// One subtask as stored on disk.
///
/// Fields other than the three known ones are kept in `extra` so a rewrite
/// does not drop them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskDescriptor {
    pub task_name: String,
    pub task_description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<Attachment>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SubtaskDescriptor {
    pub fn new(task_name: impl Into<String>, task_description: impl Into<String>) -> Self {
        Self {
            task_name: task_name.into(),
            task_description: task_description.into(),
            attachment: None,
            extra: Map::new(),
        }
    }

    pub fn attachment_paths(&self) -> Vec<&str> {
        self.attachment.as_ref().map(Attachment::paths).unwrap_or_default()
    }
}

/// A descriptor together with where it was found and its position in the task.
#[derive(Debug, Clone, PartialEq)]
pub struct Subtask {
    /// Zero-based position after ordering; used in artifact file names.
    pub index: usize,
    /// Numeric suffix from the file name, `None` when absent.
    pub order: Option<u64>,
    pub path: PathBuf,
    pub descriptor: SubtaskDescriptor,
}

/// Outcome of executing a whole-program unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    /// `false` only for syntax errors; runtime faults still count as compiled.
    pub compiled: bool,
    pub output: String,
    pub error: String,
    pub source_code: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Dependency resolution problems that did not stop execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl RunResult {
    /// Compiled and produced no error text.
    pub fn succeeded(&self) -> bool {
        self.compiled && self.error.trim().is_empty()
    }

    /// Append a line to `error`, keeping earlier text.
    pub fn append_error(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        if message.is_empty() {
            return;
        }
        if self.error.is_empty() {
            self.error = message.to_string();
        } else {
            if !self.error.ends_with('\n') {
                self.error.push('\n');
            }
            self.error.push_str(message);
        }
    }
}

/// Outcome of one generated test case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub test_description: String,
    #[serde(default)]
    pub test_cases: Vec<Value>,
    pub is_test_passed: bool,
    #[serde(default)]
    pub completion_result_values: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestResult {
    pub fn failed(description: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            test_description: description.into(),
            test_cases: Vec::new(),
            is_test_passed: false,
            completion_result_values: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Logical AND over every pass flag, stopping at the first failure.
pub fn all_passed(results: &[TestResult]) -> bool {
    results.iter().all(|r| r.is_test_passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_keeps_unknown_fields() {
        let raw = json!({
            "taskName": "Sort",
            "taskDescription": "Sort numbers",
            "priority": 2,
            "attachment": ["a.csv", " "]
        });
        let descriptor: SubtaskDescriptor = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(descriptor.attachment_paths(), vec!["a.csv"]);
        assert_eq!(descriptor.extra.get("priority"), Some(&json!(2)));
        assert_eq!(serde_json::to_value(&descriptor).unwrap(), raw);
    }

    #[test]
    fn descriptor_requires_string_description() {
        let raw = json!({"taskName": "x", "taskDescription": 5});
        assert!(serde_json::from_value::<SubtaskDescriptor>(raw).is_err());
    }

    #[test]
    fn run_result_uses_camel_case_and_hides_empty_warnings() {
        let result = RunResult {
            compiled: true,
            output: "1\n".into(),
            source_code: "print(1)".into(),
            ..RunResult::default()
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["sourceCode"], "print(1)");
        assert!(value.get("warnings").is_none());
        assert!(result.succeeded());
    }

    #[test]
    fn append_error_joins_lines() {
        let mut result = RunResult::default();
        result.append_error("first");
        result.append_error("second");
        assert_eq!(result.error, "first\nsecond");
    }

    #[test]
    fn all_passed_requires_every_case() {
        let pass = TestResult {
            test_description: "ok".into(),
            test_cases: vec![json!(1)],
            is_test_passed: true,
            completion_result_values: json!(2),
            error: None,
        };
        let fail = TestResult::failed("bad", "boom");
        assert!(all_passed(&[pass.clone(), pass.clone()]));
        assert!(!all_passed(&[pass, fail]));
        assert!(all_passed(&[]));
    }
}
