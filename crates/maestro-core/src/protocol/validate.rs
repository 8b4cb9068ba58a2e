//! Per-phase payload validators.
//!
//! Validators never fail; they return human-readable violations so callers
//! can decide whether enough of the payload is usable.

use std::collections::HashSet;

use super::types::{AnalysisData, CompletionData, PhaseData, ProgressData, TaskListData};

/// Validate a decoded payload against its phase's required fields.
pub fn validate(data: &PhaseData) -> Vec<String> {
    match data {
        PhaseData::Analysis(d) => validate_analysis(d),
        PhaseData::TaskList(d) => validate_task_list(d),
        PhaseData::Progress(d) => validate_progress(d),
        PhaseData::Completion(d) => validate_completion(d),
        PhaseData::Aggregation(d) => {
            if d.summary.trim().is_empty() {
                vec!["aggregation.summary is required".to_string()]
            } else {
                Vec::new()
            }
        }
        PhaseData::Verification(_) => Vec::new(),
    }
}

fn validate_analysis(d: &AnalysisData) -> Vec<String> {
    let mut violations = Vec::new();
    if d.summary.trim().is_empty() {
        violations.push("analysis.summary is required".to_string());
    }
    match d.recommended_task_count {
        None => violations.push("analysis.recommended_task_count is required".to_string()),
        Some(0) => violations.push("analysis.recommended_task_count must be positive".to_string()),
        Some(_) => {}
    }
    violations
}

fn validate_task_list(d: &TaskListData) -> Vec<String> {
    let mut violations = Vec::new();
    if d.tasks.is_empty() {
        violations.push("task_list.tasks must be a non-empty array".to_string());
        return violations;
    }

    let mut seen = HashSet::new();
    for (i, task) in d.tasks.iter().enumerate() {
        if task.id.trim().is_empty() {
            violations.push(format!("task_list.tasks[{i}].id is required"));
        } else if !seen.insert(task.id.as_str()) {
            violations.push(format!("task_list.tasks[{i}].id '{}' is duplicated", task.id));
        }
        if task.title.trim().is_empty() {
            violations.push(format!("task_list.tasks[{i}].title is required"));
        }
        if task.description.trim().is_empty() {
            violations.push(format!("task_list.tasks[{i}].description is required"));
        }
    }
    violations
}

fn validate_progress(d: &ProgressData) -> Vec<String> {
    match d.progress {
        Some(p) if !(0.0..=100.0).contains(&p) => {
            vec![format!("progress.progress must be within 0-100, got {p}")]
        }
        _ => Vec::new(),
    }
}

fn validate_completion(d: &CompletionData) -> Vec<String> {
    if !d.success && d.error.as_deref().is_none_or(|e| e.trim().is_empty()) {
        vec!["completion.error is required when success is false".to_string()]
    } else {
        Vec::new()
    }
}
