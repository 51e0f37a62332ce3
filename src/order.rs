//! Restores sequential compile order after parallel collection.
//!
//! Workers finish in whatever order the OS schedules them, but consumers of
//! the result (concatenated bundles, mostly) need the order a depth-first,
//! one-file-at-a-time resolver would have produced: every dependency before
//! the file that requires it, siblings in declaration order.

use crate::compiler::CompiledUnit;
use std::collections::{HashMap, HashSet};

/// Reorder `accumulated` to match sequential depth-first resolution.
///
/// `expand` maps a requirement name to the canonical id carried by
/// [`CompiledUnit::filename`]. Units whose id is not reachable from
/// `root_requirements` are kept, after all reachable ones, in their
/// original relative order.
pub fn correct_order<F>(
    accumulated: Vec<CompiledUnit>,
    root_requirements: &[String],
    expand: F,
) -> Vec<CompiledUnit>
where
    F: Fn(&str) -> String,
{
    let graph: HashMap<String, Vec<String>> = accumulated
        .iter()
        .map(|unit| {
            let deps = unit
                .direct_requirements
                .iter()
                .map(|r| expand(r.as_str()))
                .collect();
            (unit.filename.clone(), deps)
        })
        .collect();

    let roots: Vec<String> = root_requirements.iter().map(|r| expand(r.as_str())).collect();
    let sequence = linearize(&graph, &roots);

    // Keep the first occurrence of each id.
    let mut position: HashMap<&str, usize> = HashMap::with_capacity(sequence.len());
    for id in &sequence {
        let next = position.len();
        position.entry(id.as_str()).or_insert(next);
    }

    let mut keyed: Vec<(usize, CompiledUnit)> = accumulated
        .into_iter()
        .map(|unit| {
            let key = position
                .get(unit.filename.as_str())
                .copied()
                .unwrap_or(usize::MAX);
            (key, unit)
        })
        .collect();
    // `sort_by_key` is stable, which keeps unmapped units in arrival order.
    keyed.sort_by_key(|(key, _)| *key);
    keyed.into_iter().map(|(_, unit)| unit).collect()
}

/// Depth-first post-order over `graph` starting from `roots`.
///
/// Ids that name no known unit are still emitted but not descended into.
fn linearize(graph: &HashMap<String, Vec<String>>, roots: &[String]) -> Vec<String> {
    let mut visited = HashSet::new();
    let mut out = Vec::with_capacity(graph.len());

    for root in roots {
        if visited.contains(root) {
            continue;
        }
        visited.insert(root.clone());

        // Explicit stack so deep requirement chains don't overflow.
        let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
        while let Some((id, next_child)) = stack.pop() {
            let children = graph.get(id).map(Vec::as_slice).unwrap_or(&[]);
            match children.get(next_child) {
                Some(child) => {
                    stack.push((id, next_child + 1));
                    if visited.insert(child.clone()) {
                        stack.push((child.as_str(), 0));
                    }
                }
                None => out.push(id.to_string()),
            }
        }
    }

    out
}
