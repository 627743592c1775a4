//! The JSON recovery cascade.
//!
//! Each strategy is a plain function over the same [`RecoveryInput`]; they are
//! tried in [`STRATEGIES`] order and the first one that yields a value wins.

use serde_json::Value;

use super::escape::{
    convert_triple_quoted, decode_literal_escapes, sanitize_control_chars, strip_code_fences,
    strip_one_quote_layer, strip_wrapping_quotes,
};

/// How many times a JSON-encoded string is unwrapped before giving up.
const MAX_UNWRAP_DEPTH: usize = 4;

/// Input shared by every strategy: the untouched text and its pre-cleaned form.
#[derive(Debug, Clone)]
pub struct RecoveryInput<'a> {
    pub raw: &'a str,
    pub cleaned: String,
    depth: usize,
}

impl<'a> RecoveryInput<'a> {
    pub fn new(raw: &'a str) -> Self {
        Self::with_depth(raw, 0)
    }

    fn with_depth(raw: &'a str, depth: usize) -> Self {
        Self {
            raw,
            cleaned: clean(raw),
            depth,
        }
    }
}

pub type Strategy = fn(&RecoveryInput<'_>) -> Option<Value>;

/// Recovery strategies in the order they are attempted.
pub const STRATEGIES: &[(&str, Strategy)] = &[
    ("direct", parse_direct),
    ("control_chars", parse_sanitized),
    ("unquoted", parse_unquoted),
    ("decoded_raw", parse_decoded_raw),
];

/// Strip fences and non-JSON quote wrapping (backticks, single quotes).
///
/// Double quotes are left alone: a double-quoted body may itself be a JSON
/// string holding the real payload.
pub fn clean(raw: &str) -> String {
    strip_wrapping_quotes(&strip_code_fences(raw), &['`', '\''])
}

/// Run the cascade and return the first structured value.
///
/// A strategy that only produces a bare string whose contents cannot be
/// recovered further does not end the search; that string is returned only
/// when no later strategy does better.
pub fn run_cascade(raw: &str) -> Option<Value> {
    run_at_depth(raw, 0)
}

fn run_at_depth(raw: &str, depth: usize) -> Option<Value> {
    let input = RecoveryInput::with_depth(raw, depth);
    let mut fallback = None;

    for (name, strategy) in STRATEGIES {
        let Some(value) = strategy(&input) else {
            continue;
        };
        match value {
            Value::String(_) => {
                tracing::trace!(strategy = name, "strategy produced an opaque string");
                fallback.get_or_insert(value);
            }
            other => {
                tracing::trace!(strategy = name, depth, "JSON recovered");
                return Some(other);
            }
        }
    }

    fallback
}

/// Parse `text` and, if the result is a JSON-encoded string, recover its inner value.
fn parse_json(text: &str, depth: usize) -> Option<Value> {
    let value: Value = serde_json::from_str(text).ok()?;
    Some(unwrap_encoded(value, depth))
}

fn unwrap_encoded(value: Value, depth: usize) -> Value {
    let Value::String(inner) = value else {
        return value;
    };
    if depth >= MAX_UNWRAP_DEPTH || inner.trim().is_empty() {
        return Value::String(inner);
    }

    if let Some(found) = run_at_depth(&inner, depth + 1).filter(|v| !v.is_string()) {
        return found;
    }
    if let Some(decoded) = decode_literal_escapes(&inner) {
        if decoded != inner {
            if let Some(found) = run_at_depth(&decoded, depth + 1).filter(|v| !v.is_string()) {
                return found;
            }
        }
    }
    Value::String(inner)
}

fn parse_direct(input: &RecoveryInput<'_>) -> Option<Value> {
    parse_json(&input.cleaned, input.depth)
}

fn parse_sanitized(input: &RecoveryInput<'_>) -> Option<Value> {
    parse_json(&sanitize_control_chars(&input.cleaned), input.depth)
}

fn parse_unquoted(input: &RecoveryInput<'_>) -> Option<Value> {
    let body = strip_one_quote_layer(&input.cleaned).unwrap_or(&input.cleaned);

    let mut candidates = Vec::with_capacity(2);
    if let Some(decoded) = decode_literal_escapes(body) {
        candidates.push(decoded);
    }
    candidates.push(body.to_string());

    candidates.iter().find_map(|candidate| {
        let converted = convert_triple_quoted(candidate);
        parse_json(&sanitize_control_chars(&converted), input.depth)
    })
}

fn parse_decoded_raw(input: &RecoveryInput<'_>) -> Option<Value> {
    let decoded = decode_literal_escapes(input.raw)?;
    let cleaned = clean(&decoded);
    parse_json(&cleaned, input.depth).or_else(|| parse_json(&sanitize_control_chars(&cleaned), input.depth))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_strips_fences_and_single_quotes_only() {
        assert_eq!(clean("```json\n'[1, 2]'\n```"), "[1, 2]");
        assert_eq!(clean("\"[1]\""), "\"[1]\"");
    }

    #[test]
    fn direct_strategy_parses_clean_json() {
        let input = RecoveryInput::new("[{\"a\": 1}]");
        assert_eq!(parse_direct(&input), Some(json!([{"a": 1}])));
    }

    #[test]
    fn direct_strategy_rejects_raw_newlines_in_strings() {
        let input = RecoveryInput::new("{\"code\": \"a\nb\"}");
        assert_eq!(parse_direct(&input), None);
        assert_eq!(parse_sanitized(&input), Some(json!({"code": "a\nb"})));
    }

    #[test]
    fn unquoted_strategy_handles_escaped_body() {
        let input = RecoveryInput::new(r#""{\"code\": \"x = 1\"}""#);
        assert_eq!(parse_unquoted(&input), Some(json!({"code": "x = 1"})));
    }

    #[test]
    fn decoded_raw_strategy_decodes_escape_sequences() {
        let input = RecoveryInput::new(r#"[{\"a\": 1}]"#);
        assert_eq!(parse_direct(&input), None);
        assert_eq!(parse_decoded_raw(&input), Some(json!([{"a": 1}])));
    }

    #[test]
    fn cascade_unwraps_double_encoded_json() {
        let clean = json!([{"function": "f", "code": "def f():\n    return 1"}]);
        let once = serde_json::to_string(&clean).unwrap();
        let twice = serde_json::to_string(&once).unwrap();
        assert_eq!(run_cascade(&twice), Some(clean));
    }

    #[test]
    fn cascade_returns_plain_string_when_nothing_better_exists() {
        assert_eq!(run_cascade("\"hello\""), Some(json!("hello")));
    }

    #[test]
    fn cascade_gives_up_on_prose() {
        assert_eq!(run_cascade("Here is your code: def f(): pass"), None);
    }
}
