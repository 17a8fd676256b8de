//! Gated delivery workflow engine.
//!
//! A project moves through locked phases (requirements lock, hardening,
//! planning, implementation, review, testing, ship) under an explicit state
//! machine. Builds execute a dependency-ordered task graph whose commands run
//! through a policy-enforced, optionally containerized executor.
//!
//! - **[`core`]**: Pure, deterministic logic (transitions, policy resolution,
//!   risk scoring, ordering, review). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (processes, containers, persisted
//!   state, audit). Isolated behind traits to enable fakes in tests.
//!
//! [`orchestrator`] runs the task graph; [`controller`] drives a whole build
//! attempt and owns the persisted workflow state.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
