//! Parallel-group layering for planned tasks.
//!
//! Groups are computed with Kahn's algorithm: each layer holds the tasks
//! whose dependencies are all satisfied by earlier layers. Tasks that can
//! never become ready (cycle, unknown dependency, or downstream of either)
//! are collected into one final group instead of stalling execution.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use super::types::Task;

/// Compute execution layers over the non-skipped tasks.
///
/// Dependencies on skipped tasks count as satisfied. Within a layer tasks
/// are ordered by ascending priority (unset last), then by plan order.
pub fn compute_parallel_groups(tasks: &[Task]) -> Vec<Vec<String>> {
    let active: Vec<(usize, &Task)> = tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.skipped)
        .collect();
    let active_ids: HashSet<&str> = active.iter().map(|(_, t)| t.id.as_str()).collect();
    let skipped_ids: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.skipped)
        .map(|t| t.id.as_str())
        .collect();

    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut unsatisfiable: HashSet<&str> = HashSet::new();

    for (_, task) in &active {
        let mut degree = 0;
        for dep in &task.dependencies {
            if active_ids.contains(dep.as_str()) && dep != &task.id {
                degree += 1;
                dependents
                    .entry(dep.as_str())
                    .or_default()
                    .push(task.id.as_str());
            } else if !skipped_ids.contains(dep.as_str()) {
                // unknown id or self-dependency
                unsatisfiable.insert(task.id.as_str());
            }
        }
        in_degree.insert(task.id.as_str(), degree);
    }

    let order: HashMap<&str, (i32, usize)> = active
        .iter()
        .map(|(i, t)| (t.id.as_str(), (t.priority.unwrap_or(i32::MAX), *i)))
        .collect();
    let sort_layer = |layer: &mut Vec<&str>| {
        layer.sort_by_key(|id| order.get(*id).copied().unwrap_or((i32::MAX, usize::MAX)));
    };

    let mut placed: HashSet<&str> = HashSet::new();
    let mut groups: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<&str> = active
        .iter()
        .map(|(_, t)| t.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0) && !unsatisfiable.contains(id))
        .collect();

    while !current.is_empty() {
        sort_layer(&mut current);
        let mut next = Vec::new();
        for &id in &current {
            placed.insert(id);
            for &ds in dependents.get(id).map_or(&[][..], Vec::as_slice) {
                if let Some(deg) = in_degree.get_mut(ds) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 && !unsatisfiable.contains(ds) && !placed.contains(ds) {
                        next.push(ds);
                    }
                }
            }
        }
        groups.push(current.iter().map(|s| (*s).to_string()).collect());
        next.dedup();
        current = next;
    }

    let mut stranded: Vec<&str> = active
        .iter()
        .map(|(_, t)| t.id.as_str())
        .filter(|id| !placed.contains(id))
        .collect();
    if !stranded.is_empty() {
        warn!(
            tasks = ?stranded,
            "Tasks with unsatisfiable dependencies moved to the final group"
        );
        sort_layer(&mut stranded);
        groups.push(stranded.iter().map(|s| (*s).to_string()).collect());
    }

    groups
}

/// Drop skipped tasks from an existing grouping, keeping its layer order.
///
/// Groups left empty are removed. With `reorder` set, each group is sorted
/// by ascending priority (unset last), then by plan order. Falls back to
/// [`compute_parallel_groups`] when the result no longer covers the
/// remaining tasks.
pub fn prune_groups(groups: &[Vec<String>], tasks: &[Task], reorder: bool) -> Vec<Vec<String>> {
    let order: HashMap<&str, (i32, usize)> = tasks
        .iter()
        .enumerate()
        .filter(|(_, t)| !t.skipped)
        .map(|(i, t)| (t.id.as_str(), (t.priority.unwrap_or(i32::MAX), i)))
        .collect();
    let pruned: Vec<Vec<String>> = groups
        .iter()
        .map(|group| {
            let mut kept: Vec<String> = group
                .iter()
                .filter(|id| order.contains_key(id.as_str()))
                .cloned()
                .collect();
            if reorder {
                kept.sort_by_key(|id| order.get(id.as_str()).copied());
            }
            kept
        })
        .filter(|group| !group.is_empty())
        .collect();

    if is_partition(&pruned, tasks) {
        pruned
    } else {
        compute_parallel_groups(tasks)
    }
}

/// Whether `groups` covers every non-skipped task exactly once and names
/// nothing else.
pub fn is_partition(groups: &[Vec<String>], tasks: &[Task]) -> bool {
    let expected: HashSet<&str> = tasks
        .iter()
        .filter(|t| !t.skipped)
        .map(|t| t.id.as_str())
        .collect();
    let mut seen: HashSet<&str> = HashSet::new();
    for id in groups.iter().flatten() {
        if !expected.contains(id.as_str()) || !seen.insert(id.as_str()) {
            return false;
        }
    }
    groups.iter().all(|g| !g.is_empty()) && seen.len() == expected.len()
}
