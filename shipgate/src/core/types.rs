//! Shared deterministic types for the workflow engine.
//!
//! These types define stable contracts between core components and the
//! persisted project files. They must not depend on external state or I/O.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One phase of the delivery lifecycle.
///
/// Serialized as `SCREAMING_SNAKE_CASE` (e.g. `CHANGE_REQUEST`) so persisted
/// state stays readable and stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    Idle,
    PrdLoaded,
    Interviewing,
    Locked,
    Bootstrapped,
    Hardened,
    Refreshed,
    Planning,
    Implementing,
    Reviewing,
    Testing,
    Shipped,
    Debugging,
    ChangeRequest,
    Paused,
    Failed,
    Aborted,
}

impl WorkflowState {
    /// Every state in declaration order.
    pub const ALL: [WorkflowState; 17] = [
        WorkflowState::Idle,
        WorkflowState::PrdLoaded,
        WorkflowState::Interviewing,
        WorkflowState::Locked,
        WorkflowState::Bootstrapped,
        WorkflowState::Hardened,
        WorkflowState::Refreshed,
        WorkflowState::Planning,
        WorkflowState::Implementing,
        WorkflowState::Reviewing,
        WorkflowState::Testing,
        WorkflowState::Shipped,
        WorkflowState::Debugging,
        WorkflowState::ChangeRequest,
        WorkflowState::Paused,
        WorkflowState::Failed,
        WorkflowState::Aborted,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkflowState::Idle => "IDLE",
            WorkflowState::PrdLoaded => "PRD_LOADED",
            WorkflowState::Interviewing => "INTERVIEWING",
            WorkflowState::Locked => "LOCKED",
            WorkflowState::Bootstrapped => "BOOTSTRAPPED",
            WorkflowState::Hardened => "HARDENED",
            WorkflowState::Refreshed => "REFRESHED",
            WorkflowState::Planning => "PLANNING",
            WorkflowState::Implementing => "IMPLEMENTING",
            WorkflowState::Reviewing => "REVIEWING",
            WorkflowState::Testing => "TESTING",
            WorkflowState::Shipped => "SHIPPED",
            WorkflowState::Debugging => "DEBUGGING",
            WorkflowState::ChangeRequest => "CHANGE_REQUEST",
            WorkflowState::Paused => "PAUSED",
            WorkflowState::Failed => "FAILED",
            WorkflowState::Aborted => "ABORTED",
        }
    }

    /// States that imply hardening artifacts already exist.
    pub fn implies_hardened(self) -> bool {
        matches!(
            self,
            WorkflowState::Hardened
                | WorkflowState::Refreshed
                | WorkflowState::Planning
                | WorkflowState::Implementing
                | WorkflowState::Reviewing
                | WorkflowState::Testing
                | WorkflowState::Shipped
                | WorkflowState::Debugging
                | WorkflowState::Paused
                | WorkflowState::Failed
                | WorkflowState::ChangeRequest
        )
    }
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkflowState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_uppercase();
        WorkflowState::ALL
            .into_iter()
            .find(|state| state.as_str() == wanted)
            .ok_or_else(|| format!("unknown workflow state '{s}'"))
    }
}

/// Flags recomputed for every transition attempt. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransitionContext {
    /// Requirements lock artifact is present.
    pub has_lock: bool,
    /// Hardening artifacts are present or implied by the current phase.
    pub is_hardened: bool,
    /// Requirements hash no longer matches the locked hash.
    pub hash_mismatch: bool,
}

impl TransitionContext {
    /// Combine two contexts, keeping any flag that either side sets.
    pub fn merged(self, other: TransitionContext) -> TransitionContext {
        TransitionContext {
            has_lock: self.has_lock || other.has_lock,
            is_hardened: self.is_hardened || other.is_hardened,
            hash_mismatch: self.hash_mismatch || other.hash_mismatch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityGate {
    Review,
    Tests,
    Security,
    Lint,
}

fn default_quality_gates() -> Vec<QualityGate> {
    vec![QualityGate::Review, QualityGate::Tests]
}

/// One executable unit of the task graph.
///
/// Field names follow the camelCase task-graph file format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub risk: Risk,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub blast_radius: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_quality_gates")]
    pub quality_gates: Vec<QualityGate>,
    #[serde(default)]
    pub risk_controls: Vec<String>,
}

impl Task {
    pub fn has_gate(&self, gate: QualityGate) -> bool {
        self.quality_gates.contains(&gate)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Epic {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub stories: Vec<Story>,
}

/// Task graph as stored on disk. Grouping carries no execution semantics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGraph {
    pub version: String,
    pub epics: Vec<Epic>,
}

impl TaskGraph {
    /// Flatten epics and stories into a single task list, preserving order.
    pub fn flatten(&self) -> Vec<Task> {
        self.epics
            .iter()
            .flat_map(|epic| epic.stories.iter())
            .flat_map(|story| story.tasks.iter().cloned())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxProvider {
    Docker,
    Podman,
    None,
}

impl SandboxProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxProvider::Docker => "docker",
            SandboxProvider::Podman => "podman",
            SandboxProvider::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxProfile {
    Strict,
    Balanced,
    Off,
}

impl SandboxProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxProfile::Strict => "strict",
            SandboxProfile::Balanced => "balanced",
            SandboxProfile::Off => "off",
        }
    }
}

/// Project-scoped isolation settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxSettings {
    pub enabled: bool,
    pub provider: SandboxProvider,
    pub profile: SandboxProfile,
}

impl SandboxSettings {
    /// Returns true if commands should be attempted inside a container.
    pub fn wants_container(&self) -> bool {
        self.enabled && self.provider != SandboxProvider::None && self.profile != SandboxProfile::Off
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: SandboxProvider::None,
            profile: SandboxProfile::Off,
        }
    }
}

impl fmt::Display for SandboxSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "enabled={} provider={} profile={}",
            self.enabled,
            self.provider.as_str(),
            self.profile.as_str()
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    Simulated,
    Local,
    Container,
}

/// Uniform result of a single command invocation, whichever path produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub ok: bool,
    pub blocked: bool,
    pub reason: Option<String>,
    pub mode: ExecMode,
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub warnings: Vec<String>,
}

impl ExecutionResult {
    /// Exit code reported for commands rejected by policy.
    pub const BLOCKED_EXIT_CODE: i32 = 126;

    pub fn blocked(command: &str, reason: String) -> Self {
        Self {
            ok: false,
            blocked: true,
            reason: Some(reason),
            mode: ExecMode::Simulated,
            command: command.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Self::BLOCKED_EXIT_CODE,
            warnings: Vec::new(),
        }
    }

    pub fn simulated(command: &str, warnings: Vec<String>) -> Self {
        Self {
            ok: true,
            blocked: false,
            reason: None,
            mode: ExecMode::Simulated,
            command: command.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            warnings,
        }
    }
}

/// Outcome of the pre-execution risk gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RiskAssessment {
    /// 0..=100, higher is safer.
    pub score: u32,
    /// Any entry halts the build.
    pub blockers: Vec<String>,
    pub warnings: Vec<String>,
}

impl RiskAssessment {
    pub fn is_blocked(&self) -> bool {
        !self.blockers.is_empty()
    }
}
