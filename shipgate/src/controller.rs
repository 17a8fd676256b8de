//! Build pipeline controller: the single writer of a project's workflow state.
//!
//! A [`BuildController`] holds the project lock for its whole lifetime. Every
//! state change is validated by [`can_transition`] before anything is written,
//! and the in-memory state only changes after the write succeeded.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::machine::can_transition;
use crate::core::policy::{PolicyCatalog, PolicyPack};
use crate::core::review::{ReviewVerdict, evaluate_review_gate};
use crate::core::risk::assess_risk;
use crate::core::types::{ExecutionResult, SandboxSettings, TransitionContext, WorkflowState};
use crate::io::audit::AuditSink;
use crate::io::collaborators::{LockChecker, StaticAnalyzer, TaskGraphProvider};
use crate::io::config::{EngineConfig, load_config};
use crate::io::policy_store::{ActivePolicy, SettingsMirror, active_policy, apply_policy_pack};
use crate::io::project_state::{
    ProjectLock, ProjectPaths, ProjectState, Session, load_project_state, write_project_state,
};
use crate::io::sandbox::CommandExecutor;
use crate::orchestrator::{BuildSummary, OrchestratorOptions, run_task_graph};

/// External collaborators consumed by a build attempt.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub task_graph: &'a dyn TaskGraphProvider,
    pub lock: &'a dyn LockChecker,
    pub static_analysis: &'a dyn StaticAnalyzer,
    pub executor: &'a dyn CommandExecutor,
    pub audit: &'a dyn AuditSink,
}

/// Fault injection for exercising failure paths.
#[derive(Debug, Clone, Default)]
pub struct BuildHooks {
    /// Fail the review gate, routing back to IMPLEMENTING.
    pub force_review_failure: bool,
    /// Fail every attempt of this task id without running its commands.
    pub force_task_failure: Option<String>,
}

/// Pre-execution gate that can block a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Risk,
    StaticAnalysis,
}

impl Gate {
    fn checkpoint(self) -> &'static str {
        match self {
            Gate::Risk => "risk-gate",
            Gate::StaticAnalysis => "static-analysis",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gate::Risk => f.write_str("Risk gate"),
            Gate::StaticAnalysis => f.write_str("Static analysis"),
        }
    }
}

/// How a build attempt ended. Each variant names a single cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// No execution target selected; no state was changed.
    ModelNotSelected,
    /// Requirements drifted from the lock; now in CHANGE_REQUEST.
    HashMismatch { expected: String, actual: String },
    /// A gate reported a blocker; now in PLANNING.
    GateBlocked { gate: Gate, reason: String },
    /// Review gate failed; now in `fallback`.
    ReviewFailed {
        reason: String,
        fallback: WorkflowState,
    },
    /// Testing failed again after the debugging retry; now in FAILED.
    Failed { task_id: String },
    Shipped { completed_tasks: Vec<String> },
}

impl BuildOutcome {
    pub fn is_shipped(&self) -> bool {
        matches!(self, BuildOutcome::Shipped { .. })
    }
}

impl fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildOutcome::ModelNotSelected => f.write_str(
                "Build requires an explicit execution target. Run `shipgate model <identity>`.",
            ),
            BuildOutcome::HashMismatch { expected, actual } => {
                write!(f, "Hash mismatch detected. expected={expected} actual={actual}")
            }
            BuildOutcome::GateBlocked { gate, reason } => {
                write!(f, "{gate} blocked build. {reason}")
            }
            BuildOutcome::ReviewFailed { reason, fallback } => {
                write!(f, "Review failed: {reason}. Returned to {fallback}.")
            }
            BuildOutcome::Failed { task_id } => {
                write!(f, "Build failed at task {task_id} after debugging retry")
            }
            BuildOutcome::Shipped { completed_tasks } => write!(
                f,
                "Build succeeded. Completed tasks: {}",
                completed_tasks.join(", ")
            ),
        }
    }
}

const HARDENED: TransitionContext = TransitionContext {
    has_lock: false,
    is_hardened: true,
    hash_mismatch: false,
};

pub struct BuildController<'a> {
    paths: ProjectPaths,
    config: EngineConfig,
    state: ProjectState,
    catalog: PolicyCatalog,
    collaborators: Collaborators<'a>,
    hooks: BuildHooks,
    _lock: ProjectLock,
}

impl<'a> BuildController<'a> {
    /// Lock the project, load config and load (or create) the persisted state.
    pub fn open(root: &Path, collaborators: Collaborators<'a>, hooks: BuildHooks) -> Result<Self> {
        let paths = ProjectPaths::new(root);
        let lock = ProjectLock::acquire(&paths.lock_path)?;
        let config = load_config(&paths.config_path)?;
        let state = if paths.state_path.exists() {
            load_project_state(&paths.state_path)?
        } else {
            let mut fresh = ProjectState::new(&config.default_policy_pack);
            fresh.session.retry_budget = config.retry_budget;
            write_project_state(&paths.state_path, &fresh)
                .context("initialize project state")?;
            debug!(root = %root.display(), "created project state");
            fresh
        };

        Ok(Self {
            paths,
            config,
            state,
            catalog: PolicyCatalog::builtin(),
            collaborators,
            hooks,
            _lock: lock,
        })
    }

    /// Replace the built-in policy catalog.
    pub fn with_catalog(mut self, catalog: PolicyCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn state(&self) -> &ProjectState {
        &self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    /// Flags for the next transition attempt, derived from the project as it is now.
    pub fn transition_context(&self) -> TransitionContext {
        let marker = self.paths.root.join(&self.config.hardening_marker).exists();
        let phase = match (self.state.state, self.state.session.last_active_state) {
            (WorkflowState::Paused, Some(last)) => last,
            (current, _) => current,
        };
        TransitionContext {
            has_lock: self.collaborators.lock.has_lock(),
            is_hardened: marker
                || self.state.state.implies_hardened()
                || phase.implies_hardened(),
            hash_mismatch: false,
        }
    }

    pub fn transition(&mut self, next: WorkflowState) -> Result<()> {
        self.transition_with(next, TransitionContext::default())
    }

    /// Transition with extra flags OR-ed into the derived context.
    pub fn transition_with(&mut self, next: WorkflowState, extra: TransitionContext) -> Result<()> {
        self.apply_transition(next, extra, |_| {})
    }

    fn transition_if_needed(&mut self, next: WorkflowState) -> Result<()> {
        if self.state.state == next {
            return Ok(());
        }
        self.transition(next)
    }

    /// Validate, then persist the new state together with `session_change` in
    /// one write, then audit.
    fn apply_transition(
        &mut self,
        next: WorkflowState,
        extra: TransitionContext,
        session_change: impl FnOnce(&mut Session),
    ) -> Result<()> {
        let from = self.state.state;
        let context = self.transition_context().merged(extra);
        can_transition(from, next, &context)?;

        self.update_state(|state| {
            state.state = next;
            session_change(&mut state.session);
        })?;
        info!(%from, to = %next, "state transition");
        self.collaborators.audit.info(
            "state.transition",
            &format!("{from} -> {next}"),
            json!({ "from": from, "to": next, "context": context }),
        )
    }

    fn update_state(&mut self, change: impl FnOnce(&mut ProjectState)) -> Result<()> {
        let mut updated = self.state.clone();
        change(&mut updated);
        write_project_state(&self.paths.state_path, &updated)?;
        self.state = updated;
        Ok(())
    }

    /// Run one end-to-end build attempt.
    ///
    /// Steps, each a possible early exit: execution target, lock hash, risk
    /// gate, static analysis, review gate, testing with one debugging retry.
    #[instrument(skip_all, fields(state = %self.state.state))]
    pub fn build(&mut self) -> Result<BuildOutcome> {
        let audit = self.collaborators.audit;

        if self.state.execution_target.is_none() {
            audit.warn(
                "build.model_missing",
                "Build blocked: execution target not selected",
                Value::Null,
            )?;
            return Ok(BuildOutcome::ModelNotSelected);
        }

        let verdict = self.collaborators.lock.verify().context("verify requirements lock")?;
        if !verdict.valid {
            let mismatch = TransitionContext {
                hash_mismatch: true,
                ..TransitionContext::default()
            };
            self.transition_with(WorkflowState::ChangeRequest, mismatch)?;
            audit.warn("build.hash_mismatch", "Lock hash mismatch", json!(verdict))?;
            return Ok(BuildOutcome::HashMismatch {
                expected: verdict.expected,
                actual: verdict.actual,
            });
        }

        let tasks = self.collaborators.task_graph.tasks().context("load task graph")?;
        let policy = self.effective_policy()?;

        let risk = assess_risk(&tasks);
        audit.info("build.risk_assessment", "Task graph risk assessed", json!(risk))?;
        if let Some(blocker) = risk.blockers.first() {
            return self.block(Gate::Risk, blocker.clone());
        }

        let analysis = self
            .collaborators
            .static_analysis
            .analyze()
            .context("run static analysis")?;
        audit.info(
            "build.static_analysis",
            "Static analysis completed",
            json!(analysis),
        )?;
        if let Some(blocker) = analysis.blockers.first() {
            return self.block(Gate::StaticAnalysis, blocker.clone());
        }

        self.transition_if_needed(WorkflowState::Planning)?;
        self.transition(WorkflowState::Implementing)?;
        self.transition(WorkflowState::Reviewing)?;

        if let ReviewVerdict::Fail { fallback, reason } =
            evaluate_review_gate(&tasks, self.hooks.force_review_failure)
        {
            audit.warn(
                "build.review_failed",
                "Review gate failed",
                json!({ "reason": reason, "fallback": fallback }),
            )?;
            self.transition_with(fallback, HARDENED)?;
            return Ok(BuildOutcome::ReviewFailed { reason, fallback });
        }

        let first_task = tasks.first().map(|t| t.id.clone());
        self.apply_transition(WorkflowState::Testing, TransitionContext::default(), |session| {
            session.current_task_id = first_task;
            session.checkpoint_id = Some("testing".to_string());
        })?;

        let sandbox = self.state.sandbox;
        let forced_failure = self.hooks.force_task_failure.clone();
        let options = OrchestratorOptions {
            sandbox: &sandbox,
            policy: policy.as_ref(),
            simulate: !self.config.execute_commands,
            forced_failure: forced_failure.as_deref(),
        };
        let executor = self.collaborators.executor;

        let mut summary = run_task_graph(&tasks, executor, audit, &options)?;
        if !summary.succeeded {
            self.enter_debugging(&summary)?;
            summary = run_task_graph(&tasks, executor, audit, &options)?;
        }

        if !summary.succeeded {
            let task_id = summary.failed_task.clone().unwrap_or_default();
            self.transition(WorkflowState::Failed)?;
            audit.error(
                "build.failed",
                "Build failed after debugging retry",
                json!({ "failedTask": task_id, "reason": summary.failure_reason }),
            )?;
            return Ok(BuildOutcome::Failed { task_id });
        }

        let retry_budget = self.config.retry_budget;
        self.apply_transition(WorkflowState::Shipped, TransitionContext::default(), |session| {
            *session = Session {
                checkpoint_id: Some("shipped".to_string()),
                retry_budget,
                ..Session::default()
            };
        })?;
        audit.info(
            "build.shipped",
            "Build lifecycle completed",
            json!({
                "completedTasks": summary.completed_tasks,
                "riskScore": risk.score,
                "staticAnalysis": analysis
                    .reports
                    .iter()
                    .map(|r| format!("{}:{}", r.tool, json!(r.status).as_str().unwrap_or("unknown")))
                    .collect::<Vec<_>>(),
            }),
        )?;
        Ok(BuildOutcome::Shipped {
            completed_tasks: summary.completed_tasks,
        })
    }

    /// Record the failure, spend one unit of retry budget and loop back to
    /// TESTING through DEBUGGING.
    fn enter_debugging(&mut self, summary: &BuildSummary) -> Result<()> {
        let failed = summary.failed_task.clone().unwrap_or_default();
        warn!(task = %failed, "testing failed; entering debugging");
        self.collaborators.audit.warn(
            "build.testing_failed",
            "Testing failed, entering debugging",
            json!({ "failedTask": failed, "reason": summary.failure_reason }),
        )?;

        self.apply_transition(WorkflowState::Debugging, HARDENED, |session| {
            session.last_failure_reason = Some(format!("testing failed on {failed}"));
            session.checkpoint_id = Some(failed.clone());
            session.retry_budget = session.retry_budget.saturating_sub(1);
        })?;
        self.collaborators.audit.info(
            "build.retest",
            "Retrying tests after debugging",
            json!({ "failedTask": failed }),
        )?;
        self.transition_with(WorkflowState::Testing, HARDENED)
    }

    fn block(&mut self, gate: Gate, reason: String) -> Result<BuildOutcome> {
        info!(%gate, reason = %reason, "build blocked by gate");
        self.update_state(|state| {
            state.session.last_failure_reason = Some(reason.clone());
            state.session.checkpoint_id = Some(gate.checkpoint().to_string());
        })?;
        self.transition_if_needed(WorkflowState::Planning)?;
        self.collaborators.audit.warn(
            "build.gate_blocked",
            &format!("{gate} blocked build"),
            json!({ "gate": gate, "reason": reason }),
        )?;
        Ok(BuildOutcome::GateBlocked { gate, reason })
    }

    /// The applied snapshot if any, else the project's configured pack.
    fn effective_policy(&self) -> Result<Option<PolicyPack>> {
        if let Some(active) = active_policy(&self.paths.policy_path)? {
            return Ok(Some(active.pack));
        }
        match self.catalog.resolve(&self.state.policy_pack) {
            Ok(pack) => Ok(Some(pack)),
            Err(err) => {
                warn!(err = %err, pack = %self.state.policy_pack, "configured policy pack unavailable; running without policy");
                Ok(None)
            }
        }
    }

    /// Enter PAUSED, remembering the phase to resume into.
    ///
    /// Returns the paused-from state, or `None` if already paused.
    pub fn pause(&mut self) -> Result<Option<WorkflowState>> {
        let prior = self.state.state;
        if prior == WorkflowState::Paused {
            return Ok(None);
        }
        let now = Utc::now();
        self.apply_transition(WorkflowState::Paused, TransitionContext::default(), |session| {
            session.paused_at = Some(now.to_rfc3339_opts(SecondsFormat::Secs, true));
            session.last_active_state = Some(prior);
            session.checkpoint_id = Some(format!("paused-{}", now.timestamp_millis()));
        })?;
        Ok(Some(prior))
    }

    /// Leave PAUSED for `target`, the recorded phase, or LOCKED.
    pub fn resume(&mut self, target: Option<WorkflowState>) -> Result<WorkflowState> {
        if self.state.state != WorkflowState::Paused {
            bail!(
                "resume is only available from PAUSED (current state {})",
                self.state.state
            );
        }
        let next = target
            .or(self.state.session.last_active_state)
            .unwrap_or(WorkflowState::Locked);
        self.apply_transition(next, TransitionContext::default(), |session| {
            session.paused_at = None;
        })?;
        Ok(next)
    }

    pub fn set_sandbox(&mut self, sandbox: SandboxSettings) -> Result<()> {
        self.update_state(|state| state.sandbox = sandbox)?;
        self.collaborators
            .audit
            .info("sandbox.updated", &sandbox.to_string(), json!(sandbox))
    }

    /// Record the explicit execution target required by [`Self::build`].
    pub fn select_model(&mut self, identity: &str) -> Result<()> {
        let identity = identity.trim();
        if identity.is_empty() {
            bail!("execution target must be non-empty");
        }
        self.update_state(|state| state.execution_target = Some(identity.to_string()))?;
        self.collaborators.audit.info(
            "model.selected",
            &format!("Execution target set to {identity}"),
            json!({ "target": identity }),
        )
    }

    /// Run one ad-hoc command under the project's sandbox settings and policy.
    pub fn execute_command(&self, command: &str, simulate: bool) -> Result<ExecutionResult> {
        let policy = self.effective_policy()?;
        let result = self.collaborators.executor.execute(
            command,
            &self.state.sandbox,
            policy.as_ref(),
            simulate,
        );
        let data = json!({
            "command": command,
            "mode": result.mode,
            "blocked": result.blocked,
            "exitCode": result.exit_code,
            "reason": result.reason,
            "warnings": result.warnings,
        });
        if result.ok {
            self.collaborators
                .audit
                .info("command.executed", "Command processed", data)?;
        } else {
            self.collaborators
                .audit
                .warn("command.failed", "Command blocked or failed", data)?;
        }
        Ok(result)
    }

    pub fn list_policies(&self) -> Result<Vec<PolicyPack>> {
        Ok(self.catalog.list()?)
    }

    /// Resolve, snapshot and mirror `name`, then make it the project's pack.
    pub fn apply_policy(
        &mut self,
        name: &str,
        mirror: &dyn SettingsMirror,
    ) -> Result<ActivePolicy> {
        let applied = match apply_policy_pack(&self.catalog, &self.paths.policy_path, name, mirror)
        {
            Ok(applied) => applied,
            Err(err) => {
                self.collaborators.audit.error(
                    "policy.apply_failed",
                    &format!("Policy pack {name} not applied"),
                    json!({ "pack": name, "error": format!("{err:#}") }),
                )?;
                return Err(err);
            }
        };
        self.update_state(|state| state.policy_pack = name.to_string())?;
        self.collaborators.audit.info(
            "policy.applied",
            &format!("Policy pack {name} applied"),
            json!({ "pack": name, "hash": applied.hash }),
        )?;
        Ok(applied)
    }
}
