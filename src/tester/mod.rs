//! Test synthesis and execution for whole-program source units.
//!
//! The unit is introspected for top-level functions, public methods and
//! constructors, cases are generated for each (model-assisted or heuristic),
//! and every case runs in one harness process against a single loaded copy
//! of the unit. A case passes when the call returns without raising; each
//! case is bounded by the sandbox's per-case timeout.

pub mod cases;
pub mod introspect;

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;

use crate::llm::CompletionClient;
use crate::sandbox::{artifacts, HarnessMode, Sandbox, SandboxError};
use crate::workspace::TestResult;

pub use cases::{heuristic_cases, TestCase};
pub use introspect::{Callable, CallableKind};

#[derive(Debug, Error)]
pub enum TesterError {
    #[error("{0}")]
    Introspect(String),

    #[error("{0}")]
    Load(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Malformed harness reply: {0}")]
    Reply(String),
}

/// Generates and runs tests against a source unit.
pub struct TestSynthesizer {
    sandbox: Sandbox,
    client: Option<Arc<dyn CompletionClient>>,
}

struct PlannedCase {
    callable: Callable,
    case: TestCase,
}

impl PlannedCase {
    fn description(&self) -> String {
        match &self.callable.kind {
            CallableKind::Function => self.case.description.clone(),
            _ => format!(
                "Test {}: {}",
                self.callable.qualified_name(),
                self.case.description
            ),
        }
    }

    fn to_request(&self) -> Value {
        json!({
            "kind": self.callable.kind_str(),
            "class": self.callable.class(),
            "name": self.callable.name,
            "inputs": self.case.inputs,
        })
    }
}

impl TestSynthesizer {
    pub fn new(sandbox: Sandbox, client: Option<Arc<dyn CompletionClient>>) -> Self {
        Self { sandbox, client }
    }

    /// Generate and run tests for `source`.
    ///
    /// `attachments` are staged and exposed exactly as [`Sandbox::execute`]
    /// does. Never fails: when the unit cannot be parsed or loaded, a single
    /// failed result `Failed to generate tests: <reason>` comes back.
    pub async fn generate_and_run(
        &self,
        source: &str,
        attachments: &[PathBuf],
        use_model_assist: bool,
    ) -> Vec<TestResult> {
        match self.try_generate_and_run(source, attachments, use_model_assist).await {
            Ok(results) => {
                tracing::info!(
                    cases = results.len(),
                    passed = results.iter().filter(|r| r.is_test_passed).count(),
                    "Tests finished"
                );
                results
            }
            Err(e) => {
                tracing::warn!(error = %e, "Test generation failed");
                vec![TestResult::failed(
                    format!("Failed to generate tests: {}", e),
                    e.to_string(),
                )]
            }
        }
    }

    async fn try_generate_and_run(
        &self,
        source: &str,
        attachments: &[PathBuf],
        use_model_assist: bool,
    ) -> Result<Vec<TestResult>, TesterError> {
        let scratch = self.sandbox.scratch_dir()?;
        let harness = self.sandbox.harness();

        let callables = introspect::introspect(harness, source, scratch.path()).await?;
        tracing::debug!(callables = callables.len(), "Introspected source");

        let mut plan = Vec::new();
        for callable in callables {
            let cases = match (&self.client, use_model_assist) {
                (Some(client), true) => cases::model_cases(client.as_ref(), &callable, source).await,
                _ => heuristic_cases(callable.param_count()),
            };
            plan.extend(cases.into_iter().map(|case| PlannedCase {
                callable: callable.clone(),
                case,
            }));
        }

        let staged = artifacts::stage_attachments(attachments, scratch.path()).await;
        for error in &staged.errors {
            tracing::warn!(error = %error, "Attachment not staged for tests");
        }

        // The unit is loaded even without cases so import-time faults surface.
        let case_timeout = self.sandbox.config().case_timeout;
        let request = json!({
            "source": source,
            "attachments": staged.exposed,
            "caseTimeout": case_timeout.as_secs_f64(),
            "cases": plan.iter().map(PlannedCase::to_request).collect::<Vec<_>>(),
        });
        let budget = harness
            .timeout()
            .saturating_add(case_timeout.saturating_mul(plan.len().try_into().unwrap_or(u32::MAX)));
        let reply = harness
            .invoke_with_timeout(HarnessMode::Test, &request, scratch.path(), budget)
            .await?;
        if !reply.ok() {
            return Err(TesterError::Load(reply.str_field("error").to_string()));
        }

        let outcomes = reply
            .payload
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| TesterError::Reply("missing results".to_string()))?;
        if outcomes.len() != plan.len() {
            return Err(TesterError::Reply(format!(
                "expected {} results, got {}",
                plan.len(),
                outcomes.len()
            )));
        }

        Ok(plan
            .iter()
            .zip(outcomes)
            .filter_map(|(planned, outcome)| to_test_result(planned, outcome))
            .collect())
    }
}

/// `None` for cases the harness skipped (methods of classes it could not build).
fn to_test_result(planned: &PlannedCase, outcome: &Value) -> Option<TestResult> {
    if outcome.get("skipped").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }
    let passed = outcome.get("passed").and_then(Value::as_bool).unwrap_or(false);
    Some(TestResult {
        test_description: planned.description(),
        test_cases: planned.case.inputs.clone(),
        is_test_passed: passed,
        completion_result_values: outcome.get("value").cloned().unwrap_or(Value::Null),
        error: if passed {
            None
        } else {
            Some(
                outcome
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            )
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::llm::testing::ScriptedClient;
    use crate::sandbox::python_available;
    use crate::workspace::all_passed;
    use std::time::Duration;

    async fn synthesizer(client: Option<Arc<dyn CompletionClient>>) -> Option<TestSynthesizer> {
        if !python_available("python3").await {
            eprintln!("python3 not available, skipping");
            return None;
        }
        let sandbox = Sandbox::new(SandboxConfig {
            exec_timeout: Duration::from_secs(20),
            auto_install: false,
            ..SandboxConfig::default()
        });
        Some(TestSynthesizer::new(sandbox, client))
    }

    #[tokio::test]
    async fn heuristic_cases_for_functions() {
        let Some(tester) = synthesizer(None).await else { return };
        let source = "def greet():\n    return 'hi'\n\ndef double(x):\n    return x * 2\n";
        let results = tester.generate_and_run(source, &[], false).await;

        assert_eq!(results.len(), 5);
        assert_eq!(results[0].test_description, "Test function with no arguments");
        assert_eq!(results[0].completion_result_values, json!("hi"));
        assert_eq!(results[1].completion_result_values, json!(2));
        assert_eq!(results[4].completion_result_values, json!("testtest"));
        assert!(all_passed(&results));
    }

    #[tokio::test]
    async fn raised_exception_fails_the_case() {
        let Some(tester) = synthesizer(None).await else { return };
        let source = "def inverse(x):\n    return 1 / x\n";
        let results = tester.generate_and_run(source, &[], false).await;

        assert_eq!(results.len(), 4);
        let zero = &results[1];
        assert!(!zero.is_test_passed);
        assert_eq!(zero.test_cases, vec![json!(0)]);
        assert_eq!(zero.error.as_deref(), Some("division by zero"));
        assert!(zero.completion_result_values["traceback"]
            .as_str()
            .unwrap()
            .contains("ZeroDivisionError"));
        assert!(!all_passed(&results));
    }

    #[tokio::test]
    async fn classes_get_constructor_and_method_cases() {
        let Some(tester) = synthesizer(None).await else { return };
        let source = "\
class Counter:
    def __init__(self):
        self.value = 0
    def bump(self):
        self.value += 1
        return self.value
    def _reset(self):
        self.value = 0

class Needy:
    def __init__(self, a, b, c):
        pass
    def work(self):
        return 1
";
        let results = tester.generate_and_run(source, &[], false).await;
        let descriptions: Vec<_> = results.iter().map(|r| r.test_description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec![
                "Test Counter.__init__: Test function with no arguments",
                "Test Counter.bump: Test function with no arguments",
                "Test Needy.__init__: Test with default values for 3 arguments",
            ]
        );
        assert!(all_passed(&results));
        assert_eq!(results[1].completion_result_values, json!(1));
    }

    #[tokio::test]
    async fn unloadable_source_yields_single_failure() {
        let Some(tester) = synthesizer(None).await else { return };

        let results = tester.generate_and_run("def broken(:\n", &[], false).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].test_description.starts_with("Failed to generate tests: Invalid Python syntax"));
        assert!(!results[0].is_test_passed);

        let results = tester
            .generate_and_run("raise RuntimeError('no')\ndef f():\n    return 1\n", &[], false)
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].test_description,
            "Failed to generate tests: Failed to execute source code: no"
        );
    }

    #[tokio::test]
    async fn model_assisted_cases_are_used() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(
            "```json\n[{\"inputs\": [[3, 1, 2]], \"description\": \"unsorted list\"}]\n```".to_string(),
        )]));
        let shared: Arc<dyn CompletionClient> = client.clone();
        let Some(tester) = synthesizer(Some(shared)).await else { return };
        let results = tester
            .generate_and_run("def sort_list(items):\n    return sorted(items)\n", &[], true)
            .await;

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].test_description, "unsorted list");
        assert_eq!(results[0].completion_result_values, json!([1, 2, 3]));
        assert_eq!(client.prompts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn no_callables_means_no_results() {
        let Some(tester) = synthesizer(None).await else { return };
        assert!(tester.generate_and_run("print('script')\n", &[], false).await.is_empty());
    }

    #[tokio::test]
    async fn crashing_script_without_callables_fails_to_load() {
        let Some(tester) = synthesizer(None).await else { return };
        let results = tester
            .generate_and_run("raise RuntimeError('boom')\n", &[], false)
            .await;
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].test_description,
            "Failed to generate tests: Failed to execute source code: boom"
        );
        assert!(!all_passed(&results));
    }

    #[tokio::test]
    async fn attachments_are_visible_while_loading() {
        let Some(tester) = synthesizer(None).await else { return };
        let inputs = tempfile::tempdir().expect("tempdir");
        let data = inputs.path().join("data.txt");
        std::fs::write(&data, "3\n4\n").unwrap();

        let source = "\
with open(attachments['data.txt']) as f:
    NUMBERS = [int(line) for line in f]

def total():
    return sum(NUMBERS)
";
        let results = tester.generate_and_run(source, &[data], false).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].is_test_passed, "{:?}", results[0].error);
        assert_eq!(results[0].completion_result_values, json!(7));
    }

    #[tokio::test]
    async fn hanging_case_fails_alone() {
        if !python_available("python3").await {
            return;
        }
        let sandbox = Sandbox::new(SandboxConfig {
            exec_timeout: Duration::from_secs(20),
            case_timeout: Duration::from_millis(500),
            auto_install: false,
            ..SandboxConfig::default()
        });
        let tester = TestSynthesizer::new(sandbox, None);
        let source = "\
def ok(a):
    return a

def hang(a):
    while True:
        pass
";
        let results = tester.generate_and_run(source, &[], false).await;

        assert_eq!(results.len(), 8);
        assert!(results[..4].iter().all(|r| r.is_test_passed));
        assert!(results[4..].iter().all(|r| !r.is_test_passed));
        assert_eq!(results[4].error.as_deref(), Some("Timed out after 0.5s"));
        assert_eq!(results[3].completion_result_values, json!("test"));
    }
}
