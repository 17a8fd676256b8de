//! Deterministic dependency ordering for the flattened task list.

use std::collections::HashSet;

use crate::core::types::Task;

/// Tasks in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOrder<'a> {
    pub tasks: Vec<&'a Task>,
    /// Ids appended in original order because their dependencies never
    /// resolved (a real cycle). Empty when ordering is sound.
    pub unresolved: Vec<String>,
}

/// Stable greedy topological sort.
///
/// Repeatedly scans the list, scheduling every task whose dependencies are
/// already scheduled or absent from the list. When a full pass makes no
/// progress the remaining tasks are appended in their original order.
pub fn order_tasks(tasks: &[Task]) -> TaskOrder<'_> {
    let known: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    let mut done: HashSet<&str> = HashSet::new();
    let mut ordered: Vec<&Task> = Vec::with_capacity(tasks.len());
    let mut unresolved = Vec::new();

    while ordered.len() < tasks.len() {
        let mut progressed = false;

        for task in tasks {
            if done.contains(task.id.as_str()) {
                continue;
            }
            let ready = task
                .depends_on
                .iter()
                .all(|dep| done.contains(dep.as_str()) || !known.contains(dep.as_str()));
            if !ready {
                continue;
            }
            ordered.push(task);
            done.insert(task.id.as_str());
            progressed = true;
        }

        if !progressed {
            for task in tasks {
                if done.insert(task.id.as_str()) {
                    ordered.push(task);
                    unresolved.push(task.id.clone());
                }
            }
            break;
        }
    }

    TaskOrder {
        tasks: ordered,
        unresolved,
    }
}
