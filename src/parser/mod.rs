//! Tolerant recovery of structured data from free-form model output.
//!
//! Model responses are supposed to be JSON but routinely arrive wrapped in
//! markdown fences, double-encoded, with raw newlines inside string literals
//! or with Python-style triple-quoted blocks. [`recover_json`] runs an ordered
//! cascade of repair strategies (see [`strategies::STRATEGIES`]) and
//! [`parse_source_units`] turns the result into [`SourceUnit`]s, degrading to
//! an opaque whole-program unit when nothing can be recovered.

pub mod escape;
pub mod strategies;
pub mod units;

use serde_json::Value;
use thiserror::Error;

pub use escape::strip_code_fences;
pub use units::{SourceUnit, UnitKind, WHOLE_SOURCE_NAME};

/// Every recovery strategy failed.
///
/// Callers never surface this: they fall back to the raw text.
#[derive(Debug, Clone, Error)]
#[error("Could not recover JSON from model output ({len} bytes)")]
pub struct ParseRecoveryExhausted {
    pub len: usize,
}

/// Result of parsing one model response into source units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    /// Whole-program unit first, then fragments.
    Structured(Vec<SourceUnit>),
    /// Nothing usable was recovered; `cleaned` is the fence-stripped text,
    /// `raw` the untouched response.
    Unstructured { raw: String, cleaned: String },
}

impl ParseOutcome {
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::Structured(_))
    }
}

/// Recover a JSON value from noisy text.
///
/// # Errors
///
/// Returns [`ParseRecoveryExhausted`] when no strategy produced a value.
pub fn recover_json(raw: &str) -> Result<Value, ParseRecoveryExhausted> {
    strategies::run_cascade(raw).ok_or(ParseRecoveryExhausted { len: raw.len() })
}

/// Parse a code-generation response into source units.
pub fn parse_source_units(raw: &str) -> ParseOutcome {
    let value = match recover_json(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to parse source units as JSON, keeping raw text");
            return unstructured(raw);
        }
    };

    match units::extract_units(&value) {
        Some(units) => {
            tracing::debug!(units = units.len(), "Recovered source units");
            ParseOutcome::Structured(units)
        }
        None => {
            tracing::warn!("Recovered JSON holds no code items, keeping raw text");
            unstructured(raw)
        }
    }
}

fn unstructured(raw: &str) -> ParseOutcome {
    ParseOutcome::Unstructured {
        raw: raw.to_string(),
        cleaned: strategies::clean(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clean_payload() -> Value {
        json!([
            {"function": "greet", "code": "def greet(name):\n    return f\"hi {name}\"", "completionOrder": 1},
            {"function": "whole_source_code", "code": "def greet(name):\n    return f\"hi {name}\"\n\nprint(greet('x'))", "completionOrder": 0},
        ])
    }

    #[test]
    fn noisy_variants_recover_the_clean_structure() {
        let expected = clean_payload();
        let compact = serde_json::to_string(&expected).unwrap();
        let pretty = serde_json::to_string_pretty(&expected).unwrap();

        let fenced = format!("```json\n{}\n```", pretty);
        let double_encoded = serde_json::to_string(&compact).unwrap();
        // Raw newlines inside the code strings.
        let unescaped_newlines = compact.replace("\\n", "\n");
        let triple_quoted = r#"[
  {"function": "greet", "code": """def greet(name):
    return 'hi'""", "completionOrder": 1},
  {"function": "whole_source_code", "code": """def greet(name):
    return f"hi {name}"

print(greet('x'))""", "completionOrder": 0}
]"#;

        for (label, text) in [
            ("fenced", fenced.as_str()),
            ("double_encoded", double_encoded.as_str()),
            ("unescaped_newlines", unescaped_newlines.as_str()),
        ] {
            assert_eq!(recover_json(text).ok(), Some(expected.clone()), "{label}");
        }

        let recovered = recover_json(triple_quoted).expect("triple quoted");
        assert_eq!(recovered[1]["code"], expected[1]["code"]);
    }

    #[test]
    fn structured_outcome_has_one_whole_program() {
        let text = serde_json::to_string(&clean_payload()).unwrap();
        let ParseOutcome::Structured(units) = parse_source_units(&text) else {
            panic!("expected structured outcome");
        };
        assert_eq!(units.iter().filter(|u| u.is_whole_program()).count(), 1);
        assert!(units[0].code.contains("print(greet('x'))"));
    }

    #[test]
    fn prose_falls_back_to_raw_text() {
        let text = "```python\nprint('hello')\n```";
        match parse_source_units(text) {
            ParseOutcome::Unstructured { raw, cleaned } => {
                assert_eq!(raw, text);
                assert_eq!(cleaned, "print('hello')");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exhausted_error_reports_length() {
        let err = recover_json("not json").unwrap_err();
        assert_eq!(err.len, 8);
    }
}
