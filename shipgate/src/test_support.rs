//! Test-only builders and scripted fakes for the process, audit and
//! collaborator seams.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Result, anyhow};

use crate::core::policy::PolicyPack;
use crate::core::types::{
    ExecutionResult, QualityGate, Risk, SandboxProvider, SandboxSettings, Task, WorkflowState,
};
use crate::io::audit::{AuditEvent, AuditSink};
use crate::io::collaborators::{
    LockChecker, LockVerdict, StaticAnalysisSummary, StaticAnalyzer, TaskGraphProvider,
};
use crate::io::process::TIMEOUT_EXIT_CODE;
use crate::io::project_state::{ProjectPaths, ProjectState, write_project_state};
use crate::io::sandbox::{
    CommandExecutor, LaunchOutput, LaunchRequest, ProcessLauncher, SandboxExecutor,
};

/// Create a deterministic low-risk task that passes every gate.
pub fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        name: format!("{id} name"),
        acceptance_criteria: vec!["works".to_string()],
        risk: Risk::Low,
        tests: vec!["cargo test".to_string()],
        blast_radius: "module".to_string(),
        depends_on: Vec::new(),
        retries: 0,
        quality_gates: vec![QualityGate::Review, QualityGate::Tests],
        risk_controls: Vec::new(),
    }
}

/// Create a default task depending on `deps`.
pub fn task_with_deps(id: &str, deps: &[&str]) -> Task {
    Task {
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        ..task(id)
    }
}

/// Predetermined behavior for one launch.
#[derive(Debug, Clone)]
pub enum ScriptedLaunch {
    Exit(i32),
    Timeout,
    LaunchError(String),
}

impl ScriptedLaunch {
    pub fn exit(code: i32) -> Self {
        Self::Exit(code)
    }

    pub fn timeout() -> Self {
        Self::Timeout
    }

    pub fn launch_error(message: &str) -> Self {
        Self::LaunchError(message.to_string())
    }
}

/// Launcher that replays queued outcomes and records every call.
///
/// Calls are recorded as `local:<command>` or `container:<provider>:<command>`.
/// An exhausted queue launches successfully.
#[derive(Debug, Default)]
pub struct ScriptedLauncher {
    script: Mutex<VecDeque<ScriptedLaunch>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedLauncher {
    pub fn new(script: Vec<ScriptedLaunch>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn launch(&self, call: String) -> Result<LaunchOutput> {
        self.calls.lock().expect("calls lock").push(call);
        let next = self.script.lock().expect("script lock").pop_front();
        match next.unwrap_or(ScriptedLaunch::Exit(0)) {
            ScriptedLaunch::Exit(exit_code) => Ok(LaunchOutput {
                exit_code,
                stdout: String::new(),
                stderr: if exit_code == 0 {
                    String::new()
                } else {
                    format!("exit {exit_code}")
                },
                timed_out: false,
            }),
            ScriptedLaunch::Timeout => Ok(LaunchOutput {
                exit_code: TIMEOUT_EXIT_CODE,
                stdout: String::new(),
                stderr: String::new(),
                timed_out: true,
            }),
            ScriptedLaunch::LaunchError(message) => Err(anyhow!(message)),
        }
    }
}

impl ProcessLauncher for ScriptedLauncher {
    fn run_local(&self, request: &LaunchRequest<'_>) -> Result<LaunchOutput> {
        self.launch(format!("local:{}", request.command))
    }

    fn run_container(
        &self,
        provider: SandboxProvider,
        request: &LaunchRequest<'_>,
    ) -> Result<LaunchOutput> {
        self.launch(format!("container:{}:{}", provider.as_str(), request.command))
    }
}

/// Real [`SandboxExecutor`] over a [`ScriptedLauncher`] that also records
/// every command it was asked to execute, blocked or not.
#[derive(Debug)]
pub struct RecordingExecutor {
    inner: SandboxExecutor<ScriptedLauncher>,
    commands: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub fn new(script: Vec<ScriptedLaunch>) -> Self {
        Self {
            inner: SandboxExecutor::new(
                ScriptedLauncher::new(script),
                "/project",
                Duration::from_secs(5),
                1_000,
            ),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Commands passed to `execute`, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().expect("commands lock").clone()
    }

    /// Processes actually launched.
    pub fn launches(&self) -> Vec<String> {
        self.inner.launcher().calls()
    }
}

impl Default for RecordingExecutor {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl CommandExecutor for RecordingExecutor {
    fn execute(
        &self,
        command: &str,
        sandbox: &SandboxSettings,
        policy: Option<&PolicyPack>,
        simulate: bool,
    ) -> ExecutionResult {
        self.commands
            .lock()
            .expect("commands lock")
            .push(command.to_string());
        self.inner.execute(command, sandbox, policy, simulate)
    }
}

/// Audit sink that keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn kinds(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.kind).collect()
    }

    /// Messages of `state.transition` events, e.g. `"PLANNING -> IMPLEMENTING"`.
    pub fn transitions(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == "state.transition")
            .map(|e| e.message)
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) -> Result<()> {
        self.events.lock().expect("events lock").push(event);
        Ok(())
    }
}

/// Task graph provider returning a fixed list.
#[derive(Debug, Clone, Default)]
pub struct StaticTaskGraph(pub Vec<Task>);

impl TaskGraphProvider for StaticTaskGraph {
    fn tasks(&self) -> Result<Vec<Task>> {
        Ok(self.0.clone())
    }
}

/// Lock checker with a fixed verdict.
#[derive(Debug, Clone, Copy)]
pub struct StaticLock {
    pub has_lock: bool,
    pub valid: bool,
}

impl StaticLock {
    pub fn valid() -> Self {
        Self {
            has_lock: true,
            valid: true,
        }
    }

    pub fn drifted() -> Self {
        Self {
            has_lock: true,
            valid: false,
        }
    }
}

impl LockChecker for StaticLock {
    fn has_lock(&self) -> bool {
        self.has_lock
    }

    fn verify(&self) -> Result<LockVerdict> {
        Ok(LockVerdict {
            valid: self.valid,
            expected: "locked-hash".to_string(),
            actual: if self.valid {
                "locked-hash".to_string()
            } else {
                "drifted-hash".to_string()
            },
        })
    }
}

/// Static analyzer returning a fixed summary.
#[derive(Debug, Clone, Default)]
pub struct StaticAnalysis(pub StaticAnalysisSummary);

impl StaticAnalysis {
    pub fn blocked(blocker: &str) -> Self {
        Self(StaticAnalysisSummary {
            blockers: vec![blocker.to_string()],
            ..StaticAnalysisSummary::default()
        })
    }
}

impl StaticAnalyzer for StaticAnalysis {
    fn analyze(&self) -> Result<StaticAnalysisSummary> {
        Ok(self.0.clone())
    }
}

/// Seed `.shipgate/state.json` at `state`, optionally with an execution target.
pub fn seed_project(root: &Path, state: WorkflowState, target: Option<&str>) -> Result<()> {
    let paths = ProjectPaths::new(root);
    let mut project = ProjectState::new("default-balanced");
    project.state = state;
    project.execution_target = target.map(str::to_string);
    write_project_state(&paths.state_path, &project)
}
