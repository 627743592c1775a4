//! File and folder naming inside a task directory.

use std::sync::OnceLock;

use chrono::{DateTime, TimeZone};
use regex::Regex;

use crate::util::sanitize_name;

pub const ORIGINAL_REQUIREMENTS_FILE: &str = "Original task requirements.txt";

const WHOLE_SOURCE_PREFIX: &str = "Whole source code";
const SLUG_MAX_LEN: usize = 50;
const SLUG_MAX_WORDS: usize = 5;

fn order_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_(\d+)\.json$").expect("valid regex"))
}

fn whole_source_file() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Whole source code_subtask_(\d+)_0(?:_(\d+))?\.[A-Za-z0-9]+$").expect("valid regex")
    })
}

/// Order key embedded in a descriptor file name (`name_<digits>.json`).
pub fn order_key(file_name: &str) -> Option<u64> {
    order_suffix()
        .captures(file_name)
        .and_then(|caps| caps[1].parse().ok())
}

/// File stem for a per-function fragment.
pub fn fragment_stem(unit_name: &str, subtask_index: usize, order: u32) -> String {
    format!("Source {}_subtask_{}_{}", unit_name, subtask_index, order)
}

/// File stem for the whole-program unit.
pub fn whole_source_stem(subtask_index: usize) -> String {
    format!("{}_subtask_{}_0", WHOLE_SOURCE_PREFIX, subtask_index)
}

/// If `file_name` is a whole-program file for `subtask_index`, its collision
/// suffix (0 for the unsuffixed original).
pub fn whole_source_generation(file_name: &str, subtask_index: usize) -> Option<u32> {
    let caps = whole_source_file().captures(file_name)?;
    let index: usize = caps[1].parse().ok()?;
    if index != subtask_index {
        return None;
    }
    match caps.get(2) {
        Some(n) => n.as_str().parse().ok(),
        None => Some(0),
    }
}

pub fn run_result_file(subtask_index: usize) -> String {
    format!("Run result_subtask_{}.json", subtask_index)
}

pub fn test_result_file(subtask_index: usize, case_index: usize, passed: bool) -> String {
    let marker = if passed { "Passed" } else { "Failed" };
    format!("{} Test result_subtask_{}_test_{}.json", marker, subtask_index, case_index)
}

/// Descriptor file name written at task creation; `position` starts at 1.
pub fn descriptor_file(task_name: &str, position: usize) -> String {
    format!("{}_{}.json", sanitize_name(task_name), position)
}

/// Folder name for a task: `<taskId>_<label>`.
pub fn task_folder(task_id: &str, label: &str) -> String {
    let label = label.trim().replace(['/', '\\'], "_");
    if label.is_empty() {
        task_id.to_string()
    } else {
        format!("{}_{}", task_id, label)
    }
}

/// Human-readable label: `<YYYY-mm-dd_HH-MM-SS>_<slug>`.
pub fn task_label<Tz>(original_text: &str, now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!("{}_{}", now.format("%Y-%m-%d_%H-%M-%S"), slug(original_text))
}

/// Lowercased summary of the first few words, letters/digits/underscores only.
pub fn slug(text: &str) -> String {
    let words: Vec<String> = text
        .split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .take(SLUG_MAX_WORDS)
        .collect();

    let mut slug = words.join("_");
    slug.truncate(SLUG_MAX_LEN);
    let slug = slug.trim_matches('_');
    if slug.is_empty() {
        "task".to_string()
    } else {
        slug.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn order_key_reads_trailing_digits() {
        assert_eq!(order_key("Parse input_2.json"), Some(2));
        assert_eq!(order_key("step_10.json"), Some(10));
        assert_eq!(order_key("notes.json"), None);
        assert_eq!(order_key("step_2.json.bak"), None);
    }

    #[test]
    fn artifact_names_match_layout() {
        assert_eq!(fragment_stem("add", 1, 3), "Source add_subtask_1_3");
        assert_eq!(whole_source_stem(0), "Whole source code_subtask_0_0");
        assert_eq!(run_result_file(2), "Run result_subtask_2.json");
        assert_eq!(test_result_file(2, 0, true), "Passed Test result_subtask_2_test_0.json");
        assert_eq!(test_result_file(2, 1, false), "Failed Test result_subtask_2_test_1.json");
        assert_eq!(descriptor_file("Load data!", 1), "Load_data__1.json");
    }

    #[test]
    fn whole_source_generation_filters_by_subtask() {
        assert_eq!(whole_source_generation("Whole source code_subtask_1_0.py", 1), Some(0));
        assert_eq!(whole_source_generation("Whole source code_subtask_1_0_2.py", 1), Some(2));
        assert_eq!(whole_source_generation("Whole source code_subtask_11_0.py", 1), None);
        assert_eq!(whole_source_generation("Source f_subtask_1_0.py", 1), None);
    }

    #[test]
    fn task_label_has_timestamp_and_slug() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(
            task_label("Build a CSV report, then plot it!", &now),
            "2024-03-09_14-05-07_build_a_csv_report_then"
        );
        assert_eq!(task_label("???", &now), "2024-03-09_14-05-07_task");
    }

    #[test]
    fn task_folder_joins_id_and_label() {
        assert_eq!(task_folder("abc", "2024_x"), "abc_2024_x");
        assert_eq!(task_folder("abc", "a/b"), "abc_a_b");
        assert_eq!(task_folder("abc", " "), "abc");
    }
}
