//! Staging attachments into a scratch directory and collecting binary
//! outputs from it.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::util::unique_path;

/// Extensions (lowercase) treated as artifacts worth keeping.
pub const ARTIFACT_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "bmp", "svg", "webp", "tif", "tiff", "pdf", "doc", "docx", "xls",
    "xlsx", "ppt", "pptx", "odt",
];

pub fn is_artifact(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| ARTIFACT_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Files copied out of a run and the copy failures encountered.
#[derive(Debug, Default)]
pub struct Collected {
    pub copied: Vec<PathBuf>,
    pub errors: Vec<String>,
}

/// Attachments copied into a working directory.
#[derive(Debug, Default)]
pub struct Staged {
    /// File name to copied path, handed to the program as `attachments`
    pub exposed: BTreeMap<String, String>,
    /// Copied paths, excluded from artifact collection
    pub copies: HashSet<PathBuf>,
    pub errors: Vec<String>,
}

/// Copy each attachment into `work_dir` under its own file name.
pub async fn stage_attachments(attachments: &[PathBuf], work_dir: &Path) -> Staged {
    let mut staged = Staged::default();

    for source in attachments {
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = work_dir.join(name);
        match tokio::fs::copy(source, &target).await {
            Ok(_) => {
                staged.exposed.insert(
                    name.to_string_lossy().to_string(),
                    target.to_string_lossy().to_string(),
                );
                staged.copies.insert(target);
            }
            Err(e) => staged.errors.push(format!(
                "Failed to copy attachment {}: {}",
                source.display(),
                e
            )),
        }
    }

    staged
}

/// Copy artifact files under `work_dir` into `result_dir`.
///
/// Names that already exist in `result_dir` get a `_<n>` suffix. Paths in
/// `skip` (attachment copies) are not collected. The directory walk runs on
/// the blocking pool.
pub async fn collect(work_dir: &Path, result_dir: &Path, skip: &HashSet<PathBuf>) -> Collected {
    let (work_dir, result_dir, skip) = (work_dir.to_path_buf(), result_dir.to_path_buf(), skip.clone());
    tokio::task::spawn_blocking(move || collect_blocking(&work_dir, &result_dir, &skip))
        .await
        .unwrap_or_else(|e| Collected {
            copied: Vec::new(),
            errors: vec![format!("Artifact collection aborted: {}", e)],
        })
}

fn collect_blocking(work_dir: &Path, result_dir: &Path, skip: &HashSet<PathBuf>) -> Collected {
    let mut collected = Collected::default();

    if let Err(e) = std::fs::create_dir_all(result_dir) {
        collected.errors.push(format!(
            "Failed to create result directory {}: {}",
            result_dir.display(),
            e
        ));
        return collected;
    }

    for entry in WalkDir::new(work_dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
    {
        let path = entry.path();
        if skip.contains(path) || !is_artifact(path) {
            continue;
        }
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("artifact");
        let ext = path.extension().and_then(|s| s.to_str()).unwrap_or_default();
        let target = unique_path(result_dir, stem, ext);
        match std::fs::copy(path, &target) {
            Ok(_) => {
                tracing::debug!(from = %path.display(), to = %target.display(), "Collected artifact");
                collected.copied.push(target);
            }
            Err(e) => collected
                .errors
                .push(format!("Failed to copy artifact {}: {}", path.display(), e)),
        }
    }

    collected
}

/// Make sure each attachment is present in `result_dir` under its own name.
pub async fn ensure_attachments(attachments: &[PathBuf], result_dir: &Path) -> Collected {
    let mut collected = Collected::default();

    for source in attachments {
        let Some(name) = source.file_name() else {
            continue;
        };
        let target = result_dir.join(name);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            collected.copied.push(target);
            continue;
        }
        match tokio::fs::copy(source, &target).await {
            Ok(_) => collected.copied.push(target),
            Err(e) => collected.errors.push(format!(
                "Failed to copy attachment {}: {}",
                source.display(),
                e
            )),
        }
    }

    collected
}
