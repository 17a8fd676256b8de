//! Workflow state machine: a pure transition check over [`WorkflowState`].

use thiserror::Error;

use crate::core::types::{TransitionContext, WorkflowState};

/// Reason a requested transition was rejected.
///
/// Rejection happens before anything is written, so persisted state is never
/// affected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("hash mismatch requires transition to CHANGE_REQUEST (requested {from} -> {to})")]
    HashMismatch {
        from: WorkflowState,
        to: WorkflowState,
    },
    #[error("cannot bootstrap without lock artifacts ({from} -> BOOTSTRAPPED)")]
    MissingLock { from: WorkflowState },
    #[error("cannot enter build flow before HARDENED ({from} -> {to})")]
    NotHardened {
        from: WorkflowState,
        to: WorkflowState,
    },
    #[error("invalid transition: {from} -> {to}")]
    NotAdjacent {
        from: WorkflowState,
        to: WorkflowState,
    },
}

/// Targets reachable from anywhere so failure and interruption handling never deadlock.
const ESCAPE_STATES: [WorkflowState; 4] = [
    WorkflowState::Paused,
    WorkflowState::Failed,
    WorkflowState::Aborted,
    WorkflowState::ChangeRequest,
];

const BUILD_FLOW_STATES: [WorkflowState; 4] = [
    WorkflowState::Planning,
    WorkflowState::Implementing,
    WorkflowState::Reviewing,
    WorkflowState::Testing,
];

/// Static adjacency table: legal next states for each current state.
pub fn allowed_targets(current: WorkflowState) -> &'static [WorkflowState] {
    use WorkflowState as S;
    match current {
        S::Idle => &[S::PrdLoaded],
        S::PrdLoaded => &[S::Interviewing, S::Locked],
        S::Interviewing => &[S::PrdLoaded, S::Locked],
        S::Locked => &[S::Bootstrapped, S::ChangeRequest],
        S::Bootstrapped => &[S::Hardened, S::ChangeRequest],
        S::Hardened => &[S::Refreshed, S::Planning, S::ChangeRequest],
        S::Refreshed => &[S::Planning, S::ChangeRequest],
        S::Planning => &[S::Implementing, S::ChangeRequest],
        S::Implementing => &[S::Reviewing, S::Planning, S::ChangeRequest],
        S::Reviewing => &[S::Testing, S::Implementing, S::Planning, S::ChangeRequest],
        S::Testing => &[S::Shipped, S::Debugging, S::ChangeRequest],
        S::Shipped => &[S::Planning, S::ChangeRequest, S::PrdLoaded],
        S::Debugging => &[S::Testing, S::Implementing, S::ChangeRequest],
        S::ChangeRequest => &[S::PrdLoaded, S::Interviewing, S::Locked, S::Aborted],
        // A paused project resumes into whatever phase it was interrupted in.
        S::Paused => &[
            S::Idle,
            S::PrdLoaded,
            S::Interviewing,
            S::Locked,
            S::Bootstrapped,
            S::Hardened,
            S::Refreshed,
            S::Planning,
            S::Implementing,
            S::Reviewing,
            S::Testing,
            S::Debugging,
            S::ChangeRequest,
            S::Failed,
            S::Aborted,
            S::Shipped,
        ],
        S::Failed => &[S::Planning, S::Implementing, S::Debugging, S::Aborted],
        S::Aborted => &[S::Idle],
    }
}

/// Validate a requested transition.
///
/// Rules are applied in a fixed precedence:
/// 1. hash mismatch forces `CHANGE_REQUEST`;
/// 2. escape states are always reachable;
/// 3. `BOOTSTRAPPED` requires a lock;
/// 4. build-flow states require hardening;
/// 5. otherwise the adjacency table decides.
pub fn can_transition(
    current: WorkflowState,
    next: WorkflowState,
    context: &TransitionContext,
) -> Result<(), TransitionError> {
    if context.hash_mismatch && next != WorkflowState::ChangeRequest {
        return Err(TransitionError::HashMismatch {
            from: current,
            to: next,
        });
    }

    if ESCAPE_STATES.contains(&next) {
        return Ok(());
    }

    if next == WorkflowState::Bootstrapped && !context.has_lock {
        return Err(TransitionError::MissingLock { from: current });
    }

    if BUILD_FLOW_STATES.contains(&next) && !context.is_hardened {
        return Err(TransitionError::NotHardened {
            from: current,
            to: next,
        });
    }

    if !allowed_targets(current).contains(&next) {
        return Err(TransitionError::NotAdjacent {
            from: current,
            to: next,
        });
    }

    Ok(())
}
