//! Dependency resolver: validates a flow's task graph at creation time and
//! computes, over any task snapshot, the subset eligible to run.
//!
//! Everything here is a pure function over the given slice; the scheduler
//! calls into this module on every pass.

use super::task::{ActionId, Task, TaskStatus};
use crate::EngineError;
use std::collections::{HashMap, HashSet};

/// Validate a task set before persistence.
///
/// Rejects duplicate `action_id`s, `depend_on` entries that reference no
/// task in the set, and dependency cycles.
pub fn validate(tasks: &[Task]) -> Result<(), EngineError> {
    if tasks.is_empty() {
        return Err(EngineError::Validation("tasks is required".to_string()));
    }

    let mut ids: HashSet<&ActionId> = HashSet::with_capacity(tasks.len());
    for task in tasks {
        if task.action_id.0.is_empty() {
            return Err(EngineError::Validation("action_id is required".to_string()));
        }
        if !ids.insert(&task.action_id) {
            return Err(EngineError::Validation(format!(
                "duplicate action_id: {}",
                task.action_id
            )));
        }
    }

    for task in tasks {
        for dep in &task.depend_on {
            if !ids.contains(dep) {
                return Err(EngineError::Validation(format!(
                    "task {} depends on unknown action_id: {}",
                    task.action_id, dep
                )));
            }
        }
    }

    detect_cycle(tasks)
}

/// Three-color DFS over `depend_on` edges; a task reachable from itself
/// is rejected.
fn detect_cycle(tasks: &[Task]) -> Result<(), EngineError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let index: HashMap<&ActionId, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (&t.action_id, i))
        .collect();
    let mut color = vec![Color::White; tasks.len()];

    for start in 0..tasks.len() {
        if color[start] != Color::White {
            continue;
        }

        // Iterative DFS: (node, next edge to visit)
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        color[start] = Color::Gray;

        while let Some(frame) = stack.last_mut() {
            let (node, edge) = *frame;
            let deps = &tasks[node].depend_on;
            if edge < deps.len() {
                frame.1 += 1;
                let dep_idx = index[&deps[edge]];
                match color[dep_idx] {
                    Color::White => {
                        color[dep_idx] = Color::Gray;
                        stack.push((dep_idx, 0));
                    }
                    Color::Gray => {
                        return Err(EngineError::Validation(format!(
                            "dependency cycle involving action_id: {}",
                            tasks[dep_idx].action_id
                        )));
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }

    Ok(())
}

/// A task is ready iff it is Pending and every dependency is Success.
pub fn compute_ready(tasks: &[Task]) -> Vec<ActionId> {
    let status: HashMap<&ActionId, TaskStatus> =
        tasks.iter().map(|t| (&t.action_id, t.status)).collect();

    tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .filter(|t| {
            t.depend_on
                .iter()
                .all(|dep| status.get(dep) == Some(&TaskStatus::Success))
        })
        .map(|t| t.action_id.clone())
        .collect()
}

/// Non-terminal tasks that can never become ready because a predecessor
/// (direct or transitive) is Failed. The scheduler sweeps these to Failed
/// so a flow never hangs Running with no claimable work.
pub fn doomed(tasks: &[Task]) -> Vec<ActionId> {
    let mut failed: HashSet<&ActionId> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Failed)
        .map(|t| &t.action_id)
        .collect();

    // Fixpoint over depend_on edges
    loop {
        let mut grew = false;
        for task in tasks {
            if failed.contains(&task.action_id) || task.status.is_terminal() {
                continue;
            }
            if task.depend_on.iter().any(|dep| failed.contains(dep)) {
                failed.insert(&task.action_id);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    tasks
        .iter()
        .filter(|t| !t.status.is_terminal() && failed.contains(&t.action_id))
        .map(|t| t.action_id.clone())
        .collect()
}

/// Whether every task reached a terminal status
pub fn all_terminal(tasks: &[Task]) -> bool {
    tasks.iter().all(|t| t.status.is_terminal())
}

/// Whether any task reached Failed
pub fn any_failed(tasks: &[Task]) -> bool {
    tasks.iter().any(|t| t.status == TaskStatus::Failed)
}
