//! Dependency resolution for generated programs.
//!
//! Top-level imports are scanned from the source, probed in one harness call,
//! and each missing one gets a single bounded `pip install` attempt. Nothing
//! here aborts execution: problems come back as warnings.

use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde_json::{json, Value};
use tokio::process::Command;

use super::process::{sanitize_output, Harness, HarnessMode};
use crate::util::truncate_str;

/// Import names whose distribution is published under another name.
const DISTRIBUTION_NAMES: &[(&str, &str)] = &[
    ("cv2", "opencv-python"),
    ("PIL", "pillow"),
    ("sklearn", "scikit-learn"),
    ("skimage", "scikit-image"),
    ("yaml", "pyyaml"),
    ("bs4", "beautifulsoup4"),
    ("dateutil", "python-dateutil"),
    ("dotenv", "python-dotenv"),
    ("docx", "python-docx"),
    ("pptx", "python-pptx"),
    ("fitz", "pymupdf"),
    ("Crypto", "pycryptodome"),
    ("OpenSSL", "pyopenssl"),
    ("serial", "pyserial"),
    ("attr", "attrs"),
];

fn import_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^import[ \t]+([^#\n]+)").expect("valid regex"))
}

fn from_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^from[ \t]+([A-Za-z_]\w*)[\w.]*[ \t]+import\b").expect("valid regex"))
}

fn identifier() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_]\w*").expect("valid regex"))
}

/// Top-level package names imported at module level, in first-seen order.
///
/// Relative imports (`from . import x`) never match.
pub fn scan_imports(source: &str) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();

    for caps in import_line().captures_iter(source) {
        let Some(list) = caps.get(1) else { continue };
        for item in list.as_str().split(',') {
            if let Some(name) = identifier().find(item.trim()) {
                found.push((list.start(), name.as_str().to_string()));
            }
        }
    }
    for caps in from_line().captures_iter(source) {
        if let Some(name) = caps.get(1) {
            found.push((name.start(), name.as_str().to_string()));
        }
    }

    found.sort_by_key(|(pos, _)| *pos);
    let mut names: Vec<String> = Vec::new();
    for (_, name) in found {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Distribution to install for an import name.
pub fn distribution_name(module: &str) -> &str {
    DISTRIBUTION_NAMES
        .iter()
        .find(|(import, _)| *import == module)
        .map(|(_, dist)| *dist)
        .unwrap_or(module)
}

/// Ensure the imports of `source` are importable, returning warnings.
pub async fn resolve(
    harness: &Harness,
    source: &str,
    cwd: &Path,
    auto_install: bool,
    install_timeout: Duration,
) -> Vec<String> {
    let modules = scan_imports(source);
    if modules.is_empty() {
        return Vec::new();
    }

    let missing = match harness
        .invoke(HarnessMode::Probe, &json!({ "modules": modules }), cwd)
        .await
    {
        Ok(reply) => reply
            .payload
            .get("missing")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default(),
        Err(e) => {
            tracing::warn!(error = %e, "Dependency probe failed");
            return vec![format!("Dependency check failed: {}", e)];
        }
    };

    let mut warnings = Vec::new();
    for module in missing {
        let dist = distribution_name(&module);
        if !auto_install {
            tracing::warn!(module = %module, "Missing dependency, auto-install disabled");
            warnings.push(format!("Missing dependency '{}' (auto-install disabled)", module));
            continue;
        }
        match install(harness.python(), dist, install_timeout).await {
            Ok(()) => tracing::info!(module = %module, dist, "Installed missing dependency"),
            Err(reason) => {
                tracing::warn!(module = %module, dist, reason = %reason, "Dependency install failed");
                warnings.push(format!(
                    "Failed to install '{}' for import '{}': {}",
                    dist, module, reason
                ));
            }
        }
    }
    warnings
}

async fn install(python: &str, dist: &str, timeout: Duration) -> Result<(), String> {
    let child = Command::new(python)
        .args(["-m", "pip", "install", "--quiet", "--disable-pip-version-check", dist])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to start pip: {}", e))?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => Ok(()),
        Ok(Ok(output)) => {
            let stderr = sanitize_output(&output.stderr);
            Err(format!(
                "pip exited with {}: {}",
                output.status.code().unwrap_or(-1),
                truncate_str(stderr.trim(), 500)
            ))
        }
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {}s", timeout.as_secs())),
    }
}
