//! Side-effecting adapters: processes, containers, persisted state and audit.

pub mod audit;
pub mod collaborators;
pub mod config;
pub mod policy_store;
pub mod process;
pub mod project_state;
pub mod sandbox;
