//! Text-level repairs applied to model output before JSON parsing.
//!
//! Every function here is pure and total: malformed input comes back
//! unchanged (or as `None` where decoding is genuinely impossible).

use std::sync::OnceLock;

use regex::Regex;

fn leading_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^```[ \t]*[a-zA-Z0-9_+\-]*[ \t]*\n?").expect("valid regex"))
}

fn trailing_fence() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n?```[ \t]*$").expect("valid regex"))
}

fn triple_quoted() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)"""(.*?)"""|'''(.*?)'''"#).expect("valid regex"))
}

/// Remove a surrounding markdown fence (with optional language tag) and trim.
///
/// Stray leading/trailing backticks left over after fence removal are also
/// dropped, so `` `x = 1` `` becomes `x = 1`.
pub fn strip_code_fences(text: &str) -> String {
    let s = text.trim();
    let s = leading_fence().replace(s, "");
    let s = trailing_fence().replace(&s, "");
    let s = s.trim_start_matches('`').trim_end_matches('`');
    s.trim().to_string()
}

/// Remove matching outer quote pairs drawn from `quotes`, repeatedly.
pub fn strip_wrapping_quotes(text: &str, quotes: &[char]) -> String {
    let mut s = text.trim();
    loop {
        let mut chars = s.chars();
        let (Some(first), Some(last)) = (chars.next(), chars.next_back()) else {
            break;
        };
        if first == last && quotes.contains(&first) {
            s = s[first.len_utf8()..s.len() - last.len_utf8()].trim();
        } else {
            break;
        }
    }
    s.to_string()
}

/// Remove exactly one layer of matching `"` or `'` quoting, if present.
pub fn strip_one_quote_layer(text: &str) -> Option<&str> {
    let s = text.trim();
    if s.len() < 2 {
        return None;
    }
    let first = s.chars().next()?;
    let last = s.chars().next_back()?;
    if first == last && (first == '"' || first == '\'') {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

/// Decode backslash escape sequences the way a literal-escape codec does.
///
/// Handles `\\ \' \" \a \b \f \n \r \t \v`, octal `\ooo`, `\xhh`, `\uXXXX`
/// (with surrogate pairs) and `\UXXXXXXXX`; a backslash before a newline is a
/// line continuation. Unknown escapes are kept verbatim. Returns `None` for a
/// truncated or invalid numeric escape, or a trailing lone backslash.
pub fn decode_literal_escapes(text: &str) -> Option<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        if ch != '\\' {
            out.push(ch);
            i += 1;
            continue;
        }
        let next = *chars.get(i + 1)?;
        i += 2;
        match next {
            '\n' => {}
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0c}'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'v' => out.push('\u{0b}'),
            '0'..='7' => {
                let mut value = next.to_digit(8)?;
                let mut taken = 0;
                while taken < 2 {
                    match chars.get(i).and_then(|c| c.to_digit(8)) {
                        Some(d) => {
                            value = value * 8 + d;
                            i += 1;
                            taken += 1;
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(value)?);
            }
            'x' => {
                let value = read_hex(&chars, i, 2)?;
                i += 2;
                out.push(char::from_u32(value)?);
            }
            'u' => {
                let value = read_hex(&chars, i, 4)?;
                i += 4;
                if (0xD800..0xDC00).contains(&value) {
                    // High surrogate: only valid when a low surrogate escape follows.
                    if chars.get(i) == Some(&'\\') && chars.get(i + 1) == Some(&'u') {
                        let low = read_hex(&chars, i + 2, 4)?;
                        if (0xDC00..0xE000).contains(&low) {
                            i += 6;
                            let combined = 0x10000 + ((value - 0xD800) << 10) + (low - 0xDC00);
                            out.push(char::from_u32(combined)?);
                            continue;
                        }
                    }
                    return None;
                }
                out.push(char::from_u32(value)?);
            }
            'U' => {
                let value = read_hex(&chars, i, 8)?;
                i += 8;
                out.push(char::from_u32(value)?);
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }

    Some(out)
}

fn read_hex(chars: &[char], start: usize, len: usize) -> Option<u32> {
    if start + len > chars.len() {
        return None;
    }
    let mut value: u32 = 0;
    for c in &chars[start..start + len] {
        value = value.checked_mul(16)? + c.to_digit(16)?;
    }
    Some(value)
}

/// Escape raw control characters that appear inside JSON string literals.
///
/// A single left-to-right scan tracks whether it is inside a string and
/// whether the previous character was a backslash. Inside strings, `\n`,
/// `\r` and `\t` become their two-character escapes and other bytes below
/// 0x20 become `\u00XX`. Text outside strings is untouched.
pub fn sanitize_control_chars(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if ch == '"' && !escaped {
            out.push(ch);
            in_string = !in_string;
            continue;
        }
        if ch == '\\' && !escaped {
            out.push(ch);
            escaped = true;
            continue;
        }
        if escaped {
            out.push(ch);
            escaped = false;
            continue;
        }
        if in_string {
            match ch {
                '\n' => {
                    out.push_str("\\n");
                    continue;
                }
                '\r' => {
                    out.push_str("\\r");
                    continue;
                }
                '\t' => {
                    out.push_str("\\t");
                    continue;
                }
                c if (c as u32) < 0x20 => {
                    out.push_str(&format!("\\u{:04x}", c as u32));
                    continue;
                }
                _ => {}
            }
        }
        out.push(ch);
    }

    out
}

/// Replace `"""…"""` and `'''…'''` blocks with properly escaped JSON strings.
pub fn convert_triple_quoted(text: &str) -> String {
    triple_quoted()
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let inner = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            serde_json::to_string(inner).unwrap_or_else(|_| "\"\"".to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_fence_with_language_tag() {
        let text = "```json\n[{\"a\": 1}]\n```";
        assert_eq!(strip_code_fences(text), "[{\"a\": 1}]");
    }

    #[test]
    fn strips_bare_fence_and_stray_backticks() {
        assert_eq!(strip_code_fences("```\nprint(1)\n```  "), "print(1)");
        assert_eq!(strip_code_fences("`x = 1`"), "x = 1");
        assert_eq!(strip_code_fences("no fences here"), "no fences here");
    }

    #[test]
    fn strip_wrapping_quotes_is_repeated() {
        assert_eq!(strip_wrapping_quotes("'\"print(1)\"'", &['"', '\'']), "print(1)");
        assert_eq!(strip_wrapping_quotes("\"a\" + \"b\"", &['\'']), "\"a\" + \"b\"");
        assert_eq!(strip_wrapping_quotes("'", &['\'']), "'");
    }

    #[test]
    fn decodes_common_escapes() {
        assert_eq!(
            decode_literal_escapes(r"def f():\n\treturn 'x'\\").as_deref(),
            Some("def f():\n\treturn 'x'\\")
        );
        assert_eq!(decode_literal_escapes(r"\x41é\101").as_deref(), Some("AéA"));
        assert_eq!(decode_literal_escapes(r"\U0001F600").as_deref(), Some("😀"));
        assert_eq!(decode_literal_escapes(r"\ud83d\ude00").as_deref(), Some("😀"));
        assert_eq!(decode_literal_escapes(r"keep \q").as_deref(), Some(r"keep \q"));
    }

    #[test]
    fn rejects_truncated_escapes() {
        assert_eq!(decode_literal_escapes(r"\x4"), None);
        assert_eq!(decode_literal_escapes("trailing \\"), None);
        assert_eq!(decode_literal_escapes(r"\ud83d alone"), None);
    }

    #[test]
    fn sanitizes_only_inside_strings() {
        let text = "{\n\"code\": \"line1\nline2\tx\u{01}\"\n}";
        let sanitized = sanitize_control_chars(text);
        assert_eq!(sanitized, "{\n\"code\": \"line1\\nline2\\tx\\u0001\"\n}");
        let value: serde_json::Value = serde_json::from_str(&sanitized).unwrap();
        assert_eq!(value["code"], "line1\nline2\tx\u{01}");
    }

    #[test]
    fn sanitize_respects_escaped_quotes() {
        let text = "\"say \\\"hi\nthere\\\"\"";
        assert_eq!(sanitize_control_chars(text), "\"say \\\"hi\\nthere\\\"\"");
    }

    #[test]
    fn converts_triple_quoted_blocks() {
        let text = "{\"code\": \"\"\"def f():\n    return 'x'\"\"\"}";
        let converted = convert_triple_quoted(text);
        let value: serde_json::Value = serde_json::from_str(&converted).unwrap();
        assert_eq!(value["code"], "def f():\n    return 'x'");
    }
}
