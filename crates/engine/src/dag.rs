//! DAG validation: run this before executing a pipeline.
//!
//! Rules enforced:
//! 1. The pipeline has at least one task and task IDs are non-empty.
//! 2. Task IDs must be unique within the pipeline.
//! 3. Every edge must reference valid task IDs (both `from` and `to`).
//! 4. The directed graph must be acyclic (topological sort must succeed).
//!
//! Returns a topologically-sorted list of task IDs on success. Tasks that
//! become ready at the same time keep their declaration order.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::{EngineError, models::Pipeline};

/// Validate the pipeline's DAG and return tasks in execution order.
///
/// # Errors
/// - [`EngineError::EmptyPipeline`] / [`EngineError::EmptyTaskId`] for degenerate definitions.
/// - [`EngineError::DuplicateTaskId`] if two tasks share an ID.
/// - [`EngineError::UnknownTaskReference`] if an edge references a missing task.
/// - [`EngineError::CycleDetected`] if the graph is not acyclic.
pub fn validate_dag(pipeline: &Pipeline) -> Result<Vec<String>, EngineError> {
    if pipeline.tasks.is_empty() {
        return Err(EngineError::EmptyPipeline(pipeline.id.clone()));
    }

    // -----------------------------------------------------------------------
    // 1. Ensure task IDs are present and unique
    // -----------------------------------------------------------------------
    let mut position: HashMap<&str, usize> = HashMap::new();
    for (idx, task) in pipeline.tasks.iter().enumerate() {
        if task.id.trim().is_empty() {
            return Err(EngineError::EmptyTaskId);
        }
        if position.insert(task.id.as_str(), idx).is_some() {
            return Err(EngineError::DuplicateTaskId(task.id.clone()));
        }
    }

    // -----------------------------------------------------------------------
    // 2. Validate edge endpoints
    // -----------------------------------------------------------------------
    for edge in &pipeline.edges {
        if !position.contains_key(edge.from.as_str()) {
            return Err(EngineError::UnknownTaskReference {
                task_id: edge.from.clone(),
                side: "from",
            });
        }
        if !position.contains_key(edge.to.as_str()) {
            return Err(EngineError::UnknownTaskReference {
                task_id: edge.to.clone(),
                side: "to",
            });
        }
    }

    // -----------------------------------------------------------------------
    // 3. Topological sort (Kahn's algorithm)
    // -----------------------------------------------------------------------
    // Work on declaration indices so the ready set pops in declaration order.
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); pipeline.tasks.len()];
    let mut in_degree: Vec<usize> = vec![0; pipeline.tasks.len()];
    let mut seen_edges: HashSet<(usize, usize)> = HashSet::new();

    for edge in &pipeline.edges {
        let from = position[edge.from.as_str()];
        let to = position[edge.to.as_str()];
        // The same dependency declared twice counts once.
        if seen_edges.insert((from, to)) {
            adjacency[from].push(to);
            in_degree[to] += 1;
        }
    }

    // Seed the ready set with tasks that have no incoming edges.
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &d)| d == 0)
        .map(|(idx, _)| idx)
        .collect();

    let mut sorted: Vec<String> = Vec::with_capacity(pipeline.tasks.len());

    while let Some(idx) = ready.pop_first() {
        sorted.push(pipeline.tasks[idx].id.clone());

        for &next in &adjacency[idx] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.insert(next);
            }
        }
    }

    // If we didn't visit every task the graph contains a cycle.
    if sorted.len() != pipeline.tasks.len() {
        return Err(EngineError::CycleDetected);
    }

    Ok(sorted)
}
