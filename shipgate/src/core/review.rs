//! Review gate evaluated while the workflow sits in REVIEWING.

use crate::core::types::{Task, WorkflowState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewVerdict {
    Pass,
    /// Review failed; the workflow must move to `fallback`.
    Fail {
        fallback: WorkflowState,
        reason: String,
    },
}

/// Check that every task carries tests and acceptance criteria.
///
/// Tests are checked across the whole list before acceptance criteria. A
/// forced failure short-circuits to `IMPLEMENTING`.
pub fn evaluate_review_gate(tasks: &[Task], force_failure: bool) -> ReviewVerdict {
    if force_failure {
        return ReviewVerdict::Fail {
            fallback: WorkflowState::Implementing,
            reason: "forced review failure".to_string(),
        };
    }

    if let Some(task) = tasks.iter().find(|t| t.tests.is_empty()) {
        return ReviewVerdict::Fail {
            fallback: WorkflowState::Planning,
            reason: format!("Task {} has no test command", task.id),
        };
    }

    if let Some(task) = tasks.iter().find(|t| t.acceptance_criteria.is_empty()) {
        return ReviewVerdict::Fail {
            fallback: WorkflowState::Planning,
            reason: format!("Task {} has no acceptance criteria", task.id),
        };
    }

    ReviewVerdict::Pass
}
