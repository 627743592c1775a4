//! Language detection for stored source units.
//!
//! Detection is a list of [`LanguageRule`]s checked top to bottom; the first
//! match decides the file extension and `txt` is used when nothing matches.

use std::sync::OnceLock;

use regex::{Regex, RegexBuilder};

pub const DEFAULT_EXTENSION: &str = "txt";

/// Which part of the (trimmed) source a rule looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleScope {
    /// The whole text.
    Text,
    /// Only the text's leading bytes must equal the given prefix.
    Prefix(&'static str),
    /// The first `n` lines.
    Head(usize),
}

#[derive(Debug, Clone)]
pub struct LanguageRule {
    pub extension: String,
    pub scope: RuleScope,
    pattern: Option<Regex>,
}

impl LanguageRule {
    /// Regex rule; `case_insensitive` toggles the `i` flag, multi-line mode is always on.
    pub fn pattern(
        pattern: &str,
        extension: impl Into<String>,
        scope: RuleScope,
        case_insensitive: bool,
    ) -> Result<Self, regex::Error> {
        let regex = RegexBuilder::new(pattern)
            .multi_line(true)
            .case_insensitive(case_insensitive)
            .build()?;
        Ok(Self {
            extension: extension.into(),
            scope,
            pattern: Some(regex),
        })
    }

    /// Literal prefix rule, e.g. a shebang line.
    pub fn prefix(prefix: &'static str, extension: impl Into<String>) -> Self {
        Self {
            extension: extension.into(),
            scope: RuleScope::Prefix(prefix),
            pattern: None,
        }
    }

    fn matches(&self, code: &str) -> bool {
        match (self.scope, &self.pattern) {
            (RuleScope::Prefix(prefix), _) => code.starts_with(prefix),
            (RuleScope::Text, Some(re)) => re.is_match(code),
            (RuleScope::Head(n), Some(re)) => {
                let head: Vec<&str> = code.split('\n').take(n).collect();
                re.is_match(&head.join("\n"))
            }
            (_, None) => false,
        }
    }
}

/// Ordered rule list.
#[derive(Debug, Clone)]
pub struct LanguageRules {
    rules: Vec<LanguageRule>,
}

/// Keyword table, checked case-insensitively over the whole text.
const KEYWORD_TABLE: &[(&str, &str)] = &[
    (r#"\bimport\s+\w+\b|\bfrom\s+\w+\s+import\b|\bdef\s+\w+\s*\(|\bclass\s+\w+|\bif\s+__name__\s*=="#, "py"),
    (r#"\busing\s+\w+\s*;|\bnamespace\s+\w+|\bpublic\s+class\b|\bpublic\s+static\s+void\b"#, "cs"),
    (r#"\bfunction\s+\w+|\bconst\s+\w+\s*=|\blet\s+\w+\s*=|\bvar\s+\w+\s*=|\bconsole\.log\(|\bexport\s+(default|class|function)"#, "js"),
    (r#"\bfn\s+\w+\s*\(|\blet\s+\w+\s*=|\bmut\s+\w+|\bcrate::|\bstd::"#, "rs"),
    (r#"\bfunc\s+\w+\s*\(|\bvar\s+\w+\s+\w+|\bpackage\s+\w+|\bimport\s+"\w+""#, "go"),
    (r#"\bpackage\s+\w+\s*;|\bpublic\s+class\b|\bpublic\s+static\b|\bimport\s+\w+\.\w+\s*;"#, "java"),
    (r#"\bdef\s+\w+|\bclass\s+\w+|\brequire\s+["']|\bRuby\s+version"#, "rb"),
    (r#"\becho\s+|\bif\s+\[\[|\bwhile\s+\[\[|\bfor\s+\w+\s+in"#, "sh"),
    (r#"--.*comment|local\s+\w+|function\s+\w+"#, "lua"),
    (r#"\$\w+|\becho\b|\bforeach\b|\bfunction\b"#, "ps1"),
];

const SHEBANGS: &[(&str, &str)] = &[
    ("#!/usr/bin/env python", "py"),
    ("#!/bin/bash", "sh"),
    ("#!/usr/bin/env node", "js"),
];

/// Declarations near the top of a file, case-sensitive.
const HEAD_TABLE: &[(&str, &str)] = &[
    (r"^\s*import\s+\w+|^\s*from\s+\w+\s+import", "py"),
    (r"^\s*using\s+\w+|^\s*namespace\s+\w+", "cs"),
    (r"^\s*(import|export|const|let|var|function|class)", "js"),
];

const HEAD_LINES: usize = 10;

fn default_rules() -> &'static [LanguageRule] {
    static RULES: OnceLock<Vec<LanguageRule>> = OnceLock::new();
    RULES.get_or_init(|| {
        let keyword = KEYWORD_TABLE.iter().filter_map(|(pattern, ext)| {
            LanguageRule::pattern(pattern, *ext, RuleScope::Text, true).ok()
        });
        let shebang = SHEBANGS
            .iter()
            .map(|(prefix, ext)| LanguageRule::prefix(*prefix, *ext));
        let head = HEAD_TABLE.iter().filter_map(|(pattern, ext)| {
            LanguageRule::pattern(pattern, *ext, RuleScope::Head(HEAD_LINES), false).ok()
        });
        keyword.chain(shebang).chain(head).collect()
    })
}

impl Default for LanguageRules {
    fn default() -> Self {
        Self {
            rules: default_rules().to_vec(),
        }
    }
}

impl LanguageRules {
    pub fn new(rules: Vec<LanguageRule>) -> Self {
        Self { rules }
    }

    /// Put `rule` ahead of every existing rule.
    pub fn prepend(&mut self, rule: LanguageRule) {
        self.rules.insert(0, rule);
    }

    pub fn push(&mut self, rule: LanguageRule) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// File extension (without the dot) for `source`.
    pub fn detect(&self, source: &str) -> &str {
        let code = source.trim();
        if code.is_empty() {
            return DEFAULT_EXTENSION;
        }
        self.rules
            .iter()
            .find(|rule| rule.matches(code))
            .map(|rule| rule.extension.as_str())
            .unwrap_or(DEFAULT_EXTENSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_is_complete() {
        assert_eq!(LanguageRules::default().len(), 16);
    }

    #[test]
    fn detects_common_languages() {
        let rules = LanguageRules::default();
        assert_eq!(rules.detect("import os\nprint(os.getcwd())"), "py");
        assert_eq!(rules.detect("def add(a, b):\n    return a + b"), "py");
        assert_eq!(rules.detect("using System;\nnamespace Demo { }"), "cs");
        assert_eq!(rules.detect("const x = 1;\nconsole.log(x);"), "js");
        assert_eq!(rules.detect("fn main() {\n    println!(\"hi\");\n}"), "rs");
        assert_eq!(rules.detect("echo hello"), "sh");
    }

    #[test]
    fn unknown_and_empty_text_default_to_txt() {
        let rules = LanguageRules::default();
        assert_eq!(rules.detect(""), "txt");
        assert_eq!(rules.detect("   \n"), "txt");
        assert_eq!(rules.detect("Just a sentence."), "txt");
    }

    #[test]
    fn first_match_wins_and_rules_are_pluggable() {
        let mut rules = LanguageRules::default();
        // Matches both the py and rb keyword rules; py comes first.
        assert_eq!(rules.detect("class Foo"), "py");

        rules.prepend(LanguageRule::pattern(r"^#lang racket", "rkt", RuleScope::Head(1), false).unwrap());
        assert_eq!(rules.detect("#lang racket\n(define x 1)"), "rkt");

        let custom = LanguageRules::new(vec![LanguageRule::prefix("<?php", "php")]);
        assert_eq!(custom.detect("<?php echo 1;"), "php");
        assert_eq!(custom.detect("print(1)"), "txt");
    }
}
