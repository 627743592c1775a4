use crate::parser::escape::{decode_literal_escapes, strip_code_fences, strip_wrapping_quotes};

/// Normalise a source unit before it is compiled.
///
/// Outer quotes are removed repeatedly, literal `\n` escapes are decoded when
/// the text has no real newline, then fences and stray backticks go.
pub fn sanitize_code(raw: &str) -> String {
    let mut code = strip_wrapping_quotes(raw, &['"', '\'']);

    if code.contains("\\n") && !code.contains('\n') {
        if let Some(decoded) = decode_literal_escapes(&code) {
            code = decoded;
        }
    }

    strip_code_fences(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_quotes_and_fences() {
        assert_eq!(sanitize_code("  \"```python\nprint(1)\n```\"  "), "print(1)");
        assert_eq!(sanitize_code("'`x = 1`'"), "x = 1");
    }

    #[test]
    fn decodes_escaped_single_line_source() {
        assert_eq!(
            sanitize_code(r"def f():\n    return 1\nprint(f())"),
            "def f():\n    return 1\nprint(f())"
        );
    }

    #[test]
    fn keeps_escapes_in_multiline_source() {
        let code = "print('a\\nb')\nprint(2)";
        assert_eq!(sanitize_code(code), code);
    }
}
