//! Turning a recovered JSON value into source units.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::sanitize_name;

/// Logical name of the whole-program unit.
pub const WHOLE_SOURCE_NAME: &str = "whole_source_code";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Documentary per-function fragment; never executed.
    Fragment,
    /// The single executable program for a subtask.
    WholeProgram,
}

/// One stored piece of generated code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceUnit {
    pub name: String,
    pub code: String,
    pub completion_order: u32,
    pub kind: UnitKind,
}

impl SourceUnit {
    pub fn is_whole_program(&self) -> bool {
        self.kind == UnitKind::WholeProgram
    }
}

/// Extract units from a recovered value.
///
/// Returns `None` when the value holds no object with code in it, so the caller
/// can fall back to treating the text as unstructured. Otherwise the result
/// contains exactly one whole-program unit, placed first, followed by the
/// fragments in their original order.
pub fn extract_units(value: &Value) -> Option<Vec<SourceUnit>> {
    let items: Vec<&Map<String, Value>> = match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let obj = item.as_object();
                if obj.is_none() {
                    tracing::warn!("Skipping non-object item in parsed source list");
                }
                obj
            })
            .collect(),
        Value::Object(obj) if code_field(obj).is_some() => vec![obj],
        _ => Vec::new(),
    };

    let mut units: Vec<SourceUnit> = items
        .into_iter()
        .filter(|obj| code_field(obj).is_some())
        .map(|obj| SourceUnit {
            name: sanitize_name(name_field(obj).unwrap_or("unknown")),
            code: code_field(obj).unwrap_or_default().to_string(),
            completion_order: order_field(obj),
            kind: UnitKind::Fragment,
        })
        .collect();

    if units.is_empty() {
        return None;
    }

    let whole_idx = units
        .iter()
        .position(|u| u.name.eq_ignore_ascii_case(WHOLE_SOURCE_NAME))
        .or_else(|| units.iter().position(|u| u.completion_order == 0));

    let whole = match whole_idx {
        Some(idx) => {
            let mut unit = units.remove(idx);
            unit.name = WHOLE_SOURCE_NAME.to_string();
            unit.completion_order = 0;
            unit.kind = UnitKind::WholeProgram;
            unit
        }
        None => synthesize_whole(&units),
    };

    units.insert(0, whole);
    Some(units)
}

/// Concatenate fragments in completion order when no item is the whole program.
fn synthesize_whole(fragments: &[SourceUnit]) -> SourceUnit {
    let mut ordered: Vec<&SourceUnit> = fragments.iter().collect();
    ordered.sort_by_key(|u| u.completion_order);
    let code = ordered
        .iter()
        .map(|u| u.code.trim_end())
        .collect::<Vec<_>>()
        .join("\n\n");

    SourceUnit {
        name: WHOLE_SOURCE_NAME.to_string(),
        code,
        completion_order: 0,
        kind: UnitKind::WholeProgram,
    }
}

fn name_field(obj: &Map<String, Value>) -> Option<&str> {
    ["function", "name"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .filter(|s| !s.trim().is_empty())
}

fn code_field(obj: &Map<String, Value>) -> Option<&str> {
    ["code", "source"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
}

fn order_field(obj: &Map<String, Value>) -> u32 {
    let raw = obj
        .get("completionOrder")
        .or_else(|| obj.get("completion_order"));
    match raw {
        Some(Value::Number(n)) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0),
        Some(Value::String(s)) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}
