//! Discovery of testable callables in a source unit.

use std::path::Path;

use serde::Deserialize;
use serde_json::json;

use super::TesterError;
use crate::sandbox::{Harness, HarnessMode};

/// What a callable is and how the harness should invoke it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallableKind {
    Function,
    Method { class: String },
    Constructor { class: String },
}

/// A top-level function, public method or constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callable {
    pub kind: CallableKind,
    pub name: String,
    /// Positional parameters, `self`/`cls` excluded.
    pub params: Vec<String>,
}

impl Callable {
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// `name` for functions, `Class.name` for methods and constructors.
    pub fn qualified_name(&self) -> String {
        match &self.kind {
            CallableKind::Function => self.name.clone(),
            CallableKind::Method { class } | CallableKind::Constructor { class } => {
                format!("{}.{}", class, self.name)
            }
        }
    }

    pub fn class(&self) -> Option<&str> {
        match &self.kind {
            CallableKind::Function => None,
            CallableKind::Method { class } | CallableKind::Constructor { class } => Some(class),
        }
    }

    /// Harness wire name for the invocation kind.
    pub fn kind_str(&self) -> &'static str {
        match self.kind {
            CallableKind::Function => "function",
            CallableKind::Method { .. } => "method",
            CallableKind::Constructor { .. } => "constructor",
        }
    }
}

#[derive(Debug, Deserialize)]
struct Definition {
    name: String,
    #[serde(default)]
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClassDefinition {
    name: String,
    #[serde(default)]
    methods: Vec<Definition>,
}

#[derive(Debug, Deserialize)]
struct Inventory {
    #[serde(default)]
    functions: Vec<Definition>,
    #[serde(default)]
    classes: Vec<ClassDefinition>,
}

fn is_public(name: &str) -> bool {
    !name.starts_with('_')
}

fn method_params(args: Vec<String>) -> Vec<String> {
    let mut args = args.into_iter().peekable();
    if matches!(args.peek().map(String::as_str), Some("self" | "cls")) {
        args.next();
    }
    args.collect()
}

impl Inventory {
    /// Functions first, then each class's constructor and methods, all in source order.
    fn into_callables(self) -> Vec<Callable> {
        let mut callables: Vec<Callable> = self
            .functions
            .into_iter()
            .filter(|f| is_public(&f.name))
            .map(|f| Callable {
                kind: CallableKind::Function,
                name: f.name,
                params: f.args,
            })
            .collect();

        for class in self.classes {
            for method in class.methods {
                let kind = if method.name == "__init__" {
                    CallableKind::Constructor {
                        class: class.name.clone(),
                    }
                } else if is_public(&method.name) {
                    CallableKind::Method {
                        class: class.name.clone(),
                    }
                } else {
                    continue;
                };
                callables.push(Callable {
                    kind,
                    name: method.name,
                    params: method_params(method.args),
                });
            }
        }

        callables
    }
}

/// List the callables of `source` without executing it.
pub async fn introspect(
    harness: &Harness,
    source: &str,
    cwd: &Path,
) -> Result<Vec<Callable>, TesterError> {
    let reply = harness
        .invoke(HarnessMode::Introspect, &json!({ "source": source }), cwd)
        .await?;
    if !reply.ok() {
        return Err(TesterError::Introspect(reply.str_field("error").to_string()));
    }
    let inventory: Inventory = serde_json::from_value(reply.payload)
        .map_err(|e| TesterError::Introspect(e.to_string()))?;
    Ok(inventory.into_callables())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::sandbox::python_available;

    #[test]
    fn filters_private_and_strips_receiver() {
        let inventory: Inventory = serde_json::from_value(json!({
            "functions": [
                {"name": "add", "args": ["a", "b"]},
                {"name": "_helper", "args": []}
            ],
            "classes": [{
                "name": "Stack",
                "methods": [
                    {"name": "__init__", "args": ["self"]},
                    {"name": "push", "args": ["self", "item"]},
                    {"name": "__len__", "args": ["self"]},
                    {"name": "build", "args": ["cls", "items"]}
                ]
            }]
        }))
        .unwrap();

        let callables = inventory.into_callables();
        let names: Vec<_> = callables.iter().map(Callable::qualified_name).collect();
        assert_eq!(names, vec!["add", "Stack.__init__", "Stack.push", "Stack.build"]);
        assert_eq!(callables[0].param_count(), 2);
        assert_eq!(callables[1].param_count(), 0);
        assert_eq!(callables[1].kind_str(), "constructor");
        assert_eq!(callables[2].params, vec!["item"]);
        assert_eq!(callables[3].params, vec!["items"]);
    }

    #[tokio::test]
    async fn introspects_top_level_definitions_only() {
        if !python_available("python3").await {
            eprintln!("python3 not available, skipping");
            return;
        }
        let harness = Harness::new(&SandboxConfig::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let source = "\
def outer(x):
    def inner(y):
        return y
    return inner(x)

async def fetch(url, retries):
    return url

class Counter:
    def __init__(self, start=0):
        self.value = start
    def bump(self):
        self.value += 1
        return self.value
";
        let callables = introspect(&harness, source, dir.path()).await.unwrap();
        let names: Vec<_> = callables.iter().map(Callable::qualified_name).collect();
        assert_eq!(names, vec!["outer", "fetch", "Counter.__init__", "Counter.bump"]);
        assert_eq!(callables[1].param_count(), 2);
        assert_eq!(callables[2].params, vec!["start"]);
    }

    #[tokio::test]
    async fn invalid_syntax_is_an_error() {
        if !python_available("python3").await {
            return;
        }
        let harness = Harness::new(&SandboxConfig::default());
        let dir = tempfile::tempdir().expect("tempdir");
        let err = introspect(&harness, "def f(:", dir.path()).await.unwrap_err();
        assert!(err.to_string().starts_with("Invalid Python syntax"));
    }
}
