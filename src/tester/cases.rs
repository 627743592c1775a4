//! Test case generation: model-assisted with a heuristic fallback.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::introspect::Callable;
use crate::llm::CompletionClient;
use crate::parser::{recover_json, strip_code_fences};

const SYSTEM_PROMPT: &str =
    "You write unit test inputs for Python code. Reply with a JSON array only.";

/// Positional inputs for one invocation plus a short description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub inputs: Vec<Value>,
    pub description: String,
}

impl TestCase {
    fn new(inputs: Vec<Value>, description: &str) -> Self {
        Self {
            inputs,
            description: description.to_string(),
        }
    }
}

/// Fixed cases keyed on the parameter count.
pub fn heuristic_cases(param_count: usize) -> Vec<TestCase> {
    match param_count {
        0 => vec![TestCase::new(vec![], "Test function with no arguments")],
        1 => vec![
            TestCase::new(vec![json!(1)], "Test with positive integer"),
            TestCase::new(vec![json!(0)], "Test with zero"),
            TestCase::new(vec![json!(-1)], "Test with negative integer"),
            TestCase::new(vec![json!("test")], "Test with string"),
        ],
        2 => vec![
            TestCase::new(vec![json!(1), json!(2)], "Test with two positive integers"),
            TestCase::new(vec![json!(0), json!(0)], "Test with two zeros"),
            TestCase::new(vec![json!(-1), json!(5)], "Test with mixed signs"),
            TestCase::new(vec![json!("a"), json!("b")], "Test with two strings"),
        ],
        n => vec![TestCase::new(
            vec![json!(0); n],
            &format!("Test with default values for {} arguments", n),
        )],
    }
}

pub fn case_prompt(callable: &Callable, source: &str) -> String {
    format!(
        r#"Generate 3-5 test cases for the following Python function:

Function name: {name}
Arguments: {args:?}

Source code context:
{source}

For each test case, provide:
1. Input values as a list (match the function arguments)
2. Expected behavior or edge cases to test

Return the test cases as a JSON array where each test case has:
- "inputs": array of input values
- "description": brief description of what this test case checks

Example format:
[
  {{"inputs": [1, 2], "description": "Test with positive integers"}},
  {{"inputs": [0, 0], "description": "Test with zeros"}},
  {{"inputs": [-1, 5], "description": "Test with negative number"}}
]

Only return the JSON array, nothing else."#,
        name = callable.qualified_name(),
        args = callable.params,
    )
}

/// Read cases out of a model reply.
///
/// Items without an `inputs` array are dropped; `None` when nothing usable remains.
pub fn parse_model_cases(response: &str) -> Option<Vec<TestCase>> {
    let value = recover_json(&strip_code_fences(response)).ok()?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("test_cases").or_else(|| map.remove("tests")) {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };

    let cases: Vec<TestCase> = items
        .into_iter()
        .filter_map(|item| {
            let inputs = item.get("inputs")?.as_array()?.clone();
            let description = item
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("No description")
                .to_string();
            Some(TestCase {
                inputs,
                description,
            })
        })
        .collect();

    (!cases.is_empty()).then_some(cases)
}

/// Ask the model for cases, falling back to [`heuristic_cases`] on any failure.
pub async fn model_cases(
    client: &dyn CompletionClient,
    callable: &Callable,
    source: &str,
) -> Vec<TestCase> {
    let fallback = || heuristic_cases(callable.param_count());
    match client.complete(SYSTEM_PROMPT, &case_prompt(callable, source)).await {
        Ok(response) => parse_model_cases(&response).unwrap_or_else(|| {
            tracing::warn!(callable = %callable.qualified_name(), "Unusable test cases from model, using heuristics");
            fallback()
        }),
        Err(e) => {
            tracing::warn!(callable = %callable.qualified_name(), error = %e, "Test case request failed, using heuristics");
            fallback()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedClient;
    use crate::llm::LlmError;
    use crate::tester::introspect::CallableKind;

    fn function(params: &[&str]) -> Callable {
        Callable {
            kind: CallableKind::Function,
            name: "f".to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn heuristic_case_counts() {
        assert_eq!(heuristic_cases(0).len(), 1);
        assert_eq!(heuristic_cases(0)[0].inputs, Vec::<Value>::new());
        assert_eq!(heuristic_cases(1).len(), 4);
        assert_eq!(heuristic_cases(2)[2].inputs, vec![json!(-1), json!(5)]);
        let many = heuristic_cases(4);
        assert_eq!(many.len(), 1);
        assert_eq!(many[0].inputs, vec![json!(0); 4]);
    }

    #[test]
    fn parses_fenced_model_reply() {
        let reply = "```json\n[{\"inputs\": [2, 3], \"description\": \"small\"}, {\"inputs\": 5}, {\"inputs\": []}]\n```";
        let cases = parse_model_cases(reply).unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].inputs, vec![json!(2), json!(3)]);
        assert_eq!(cases[1].description, "No description");
    }

    #[test]
    fn rejects_replies_without_cases() {
        assert!(parse_model_cases("I cannot help with that").is_none());
        assert!(parse_model_cases("[]").is_none());
        assert!(parse_model_cases("{\"note\": 1}").is_none());
    }

    #[test]
    fn prompt_names_callable_and_arguments() {
        let prompt = case_prompt(&function(&["a", "b"]), "def f(a, b): pass");
        assert!(prompt.contains("Function name: f"));
        assert!(prompt.contains(r#"Arguments: ["a", "b"]"#));
        assert!(prompt.contains("def f(a, b): pass"));
    }

    #[tokio::test]
    async fn falls_back_to_heuristics() {
        let client = ScriptedClient::new(vec![
            Ok("not json at all".to_string()),
            Err(LlmError::network_error("down".to_string())),
        ]);
        let callable = function(&["x"]);
        assert_eq!(model_cases(&client, &callable, "").await.len(), 4);
        assert_eq!(model_cases(&client, &callable, "").await.len(), 4);
        assert_eq!(client.prompts.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn uses_model_cases_when_valid() {
        let client = ScriptedClient::new(vec![Ok(
            r#"[{"inputs": [[3, 1, 2]], "description": "unsorted"}]"#.to_string(),
        )]);
        let cases = model_cases(&client, &function(&["items"]), "").await;
        assert_eq!(cases, vec![TestCase::new(vec![json!([3, 1, 2])], "unsorted")]);
    }
}
