//! Sequential task-graph execution with per-task quality gates and retries.

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::core::ordering::order_tasks;
use crate::core::policy::PolicyPack;
use crate::core::types::{QualityGate, SandboxSettings, Task};
use crate::io::audit::AuditSink;
use crate::io::sandbox::CommandExecutor;

/// Inputs shared by every command of one orchestration run.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorOptions<'a> {
    pub sandbox: &'a SandboxSettings,
    pub policy: Option<&'a PolicyPack>,
    /// Decide policy for every command but launch nothing.
    pub simulate: bool,
    /// Fault injection: every attempt of this task fails without running a command.
    pub forced_failure: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    pub succeeded: bool,
    pub completed_tasks: Vec<String>,
    pub failed_task: Option<String>,
    /// Why `failed_task` failed, for session bookkeeping.
    pub failure_reason: Option<String>,
}

enum TaskOutcome {
    Completed,
    Failed(String),
}

/// Run every task in dependency order, stopping at the first failed task.
///
/// Audit failures are propagated; task failures are reported in the summary.
#[instrument(skip_all, fields(tasks = tasks.len(), simulate = options.simulate))]
pub fn run_task_graph<E: CommandExecutor + ?Sized>(
    tasks: &[Task],
    executor: &E,
    audit: &dyn AuditSink,
    options: &OrchestratorOptions<'_>,
) -> Result<BuildSummary> {
    let order = order_tasks(tasks);
    if !order.unresolved.is_empty() {
        warn!(unresolved = ?order.unresolved, "dependency cycle; running remaining tasks in original order");
        audit.warn(
            "build.order.cycle",
            "Dependency cycle detected; remaining tasks run in original order",
            json!({ "unresolved": order.unresolved }),
        )?;
    }

    let mut completed_tasks = Vec::with_capacity(order.tasks.len());
    for task in order.tasks {
        match run_task(task, executor, audit, options)? {
            TaskOutcome::Completed => completed_tasks.push(task.id.clone()),
            TaskOutcome::Failed(reason) => {
                debug!(task = %task.id, reason = %reason, "task failed; halting run");
                return Ok(BuildSummary {
                    succeeded: false,
                    completed_tasks,
                    failed_task: Some(task.id.clone()),
                    failure_reason: Some(reason),
                });
            }
        }
    }

    Ok(BuildSummary {
        succeeded: true,
        completed_tasks,
        failed_task: None,
        failure_reason: None,
    })
}

fn run_task<E: CommandExecutor + ?Sized>(
    task: &Task,
    executor: &E,
    audit: &dyn AuditSink,
    options: &OrchestratorOptions<'_>,
) -> Result<TaskOutcome> {
    audit.info(
        "build.task.start",
        "Executing task lifecycle",
        json!({
            "task": task.id,
            "retries": task.retries,
            "dependsOn": task.depends_on,
            "qualityGates": task.quality_gates,
            "riskControls": task.risk_controls,
        }),
    )?;

    if let Some(reason) = unmet_quality_gate(task) {
        audit.error("build.task.failed", reason, json!({ "task": task.id }))?;
        return Ok(TaskOutcome::Failed(reason.to_string()));
    }

    let forced = options.forced_failure == Some(task.id.as_str());
    let mut last_failure = String::from("Forced task failure for testing");
    for attempt in 0..=task.retries {
        if forced {
            audit.warn(
                "build.task.retry",
                "Forced task failure for testing",
                json!({ "task": task.id, "attempt": attempt }),
            )?;
            continue;
        }

        if let Some(reason) = run_attempt(task, executor, audit, options)? {
            audit.warn(
                "build.task.retry",
                "Task attempt failed",
                json!({ "task": task.id, "attempt": attempt, "reason": reason }),
            )?;
            last_failure = reason;
            continue;
        }

        audit.info(
            "build.task.complete",
            "Task completed",
            json!({ "task": task.id, "blastRadius": task.blast_radius, "attempt": attempt }),
        )?;
        return Ok(TaskOutcome::Completed);
    }

    audit.error(
        "build.task.failed",
        "Task retries exhausted",
        json!({ "task": task.id, "reason": last_failure }),
    )?;
    Ok(TaskOutcome::Failed(last_failure))
}

fn unmet_quality_gate(task: &Task) -> Option<&'static str> {
    if task.has_gate(QualityGate::Tests) && task.tests.is_empty() {
        return Some("Task missing required tests quality gate");
    }
    if task.has_gate(QualityGate::Security) && task.risk_controls.is_empty() {
        return Some("Task missing security risk controls");
    }
    None
}

/// Run every command of one attempt in order. Returns the failure reason of
/// the first blocked or failed command.
fn run_attempt<E: CommandExecutor + ?Sized>(
    task: &Task,
    executor: &E,
    audit: &dyn AuditSink,
    options: &OrchestratorOptions<'_>,
) -> Result<Option<String>> {
    for command in &task.tests {
        let execution = executor.execute(command, options.sandbox, options.policy, options.simulate);
        audit.info(
            "build.task.command",
            "Task command processed",
            json!({
                "task": task.id,
                "command": command,
                "mode": execution.mode,
                "blocked": execution.blocked,
                "exitCode": execution.exit_code,
                "warnings": execution.warnings,
            }),
        )?;

        if execution.blocked || !execution.ok {
            let reason = execution
                .reason
                .clone()
                .unwrap_or_else(|| format!("{command} failed"));
            audit.error(
                "build.task.command_failed",
                "Task command failed",
                json!({
                    "task": task.id,
                    "command": command,
                    "reason": reason,
                    "stderr": execution.stderr,
                }),
            )?;
            return Ok(Some(reason));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::PolicyCatalog;
    use crate::test_support::{
        MemoryAuditSink, RecordingExecutor, ScriptedLaunch, task, task_with_deps,
    };

    fn options(sandbox: &SandboxSettings) -> OrchestratorOptions<'_> {
        OrchestratorOptions {
            sandbox,
            policy: None,
            simulate: false,
            forced_failure: None,
        }
    }

    #[test]
    fn runs_tasks_in_dependency_order() {
        let mut b = task_with_deps("b", &["a"]);
        b.tests = vec!["pnpm test b".to_string()];
        let tasks = vec![b, task("a")];
        let executor = RecordingExecutor::default();
        let audit = MemoryAuditSink::default();
        let sandbox = SandboxSettings::default();

        let summary = run_task_graph(&tasks, &executor, &audit, &options(&sandbox)).expect("run");
        assert!(summary.succeeded);
        assert_eq!(summary.completed_tasks, vec!["a", "b"]);
        assert_eq!(executor.commands(), vec!["cargo test", "pnpm test b"]);
        assert_eq!(
            audit.kinds(),
            vec![
                "build.task.start",
                "build.task.command",
                "build.task.complete",
                "build.task.start",
                "build.task.command",
                "build.task.complete",
            ]
        );
    }

    #[test]
    fn tests_gate_without_commands_never_invokes_executor() {
        let mut bare = task("a");
        bare.tests.clear();
        bare.quality_gates = vec![QualityGate::Tests];
        let executor = RecordingExecutor::default();
        let audit = MemoryAuditSink::default();
        let sandbox = SandboxSettings::default();

        let summary = run_task_graph(&[bare], &executor, &audit, &options(&sandbox)).expect("run");
        assert!(!summary.succeeded);
        assert_eq!(summary.failed_task.as_deref(), Some("a"));
        assert_eq!(
            summary.failure_reason.as_deref(),
            Some("Task missing required tests quality gate")
        );
        assert!(executor.commands().is_empty());
    }

    #[test]
    fn security_gate_requires_risk_controls() {
        let mut risky = task("a");
        risky.quality_gates.push(QualityGate::Security);
        let executor = RecordingExecutor::default();
        let audit = MemoryAuditSink::default();
        let sandbox = SandboxSettings::default();

        let summary = run_task_graph(&[risky], &executor, &audit, &options(&sandbox)).expect("run");
        assert_eq!(summary.failed_task.as_deref(), Some("a"));
        assert_eq!(
            summary.failure_reason.as_deref(),
            Some("Task missing security risk controls")
        );
        assert!(executor.commands().is_empty());
    }

    #[test]
    fn retry_succeeds_after_failed_attempt() {
        let mut flaky = task("a");
        flaky.retries = 1;
        flaky.tests = vec!["unit".to_string(), "e2e".to_string()];
        let executor = RecordingExecutor::new(vec![ScriptedLaunch::exit(1)]);
        let audit = MemoryAuditSink::default();
        let sandbox = SandboxSettings::default();

        let summary = run_task_graph(&[flaky], &executor, &audit, &options(&sandbox)).expect("run");
        assert!(summary.succeeded);
        // The first attempt aborts at "unit"; "e2e" only runs on the retry.
        assert_eq!(executor.commands(), vec!["unit", "unit", "e2e"]);
        assert!(audit.kinds().iter().any(|k| k == "build.task.retry"));
    }

    #[test]
    fn exhausted_retries_report_last_command_failure() {
        let mut flaky = task("a");
        flaky.retries = 1;
        let executor =
            RecordingExecutor::new(vec![ScriptedLaunch::exit(1), ScriptedLaunch::exit(2)]);
        let audit = MemoryAuditSink::default();
        let sandbox = SandboxSettings::default();

        let summary = run_task_graph(&[flaky], &executor, &audit, &options(&sandbox)).expect("run");
        assert_eq!(summary.failed_task.as_deref(), Some("a"));
        assert_eq!(
            summary.failure_reason.as_deref(),
            Some("Command failed with exit code 2")
        );
        assert_eq!(executor.launches().len(), 2);
    }

    #[test]
    fn forced_failure_consumes_every_attempt_without_running() {
        let mut target = task("a");
        target.retries = 2;
        let tasks = vec![target, task("b")];
        let executor = RecordingExecutor::default();
        let audit = MemoryAuditSink::default();
        let sandbox = SandboxSettings::default();
        let opts = OrchestratorOptions {
            forced_failure: Some("a"),
            ..options(&sandbox)
        };

        let summary = run_task_graph(&tasks, &executor, &audit, &opts).expect("run");
        assert!(!summary.succeeded);
        assert_eq!(summary.failed_task.as_deref(), Some("a"));
        assert!(summary.completed_tasks.is_empty());
        assert!(executor.commands().is_empty());
        let retries = audit
            .kinds()
            .iter()
            .filter(|k| *k == "build.task.retry")
            .count();
        assert_eq!(retries, 3);
    }

    #[test]
    fn first_failed_task_halts_independent_tasks() {
        let tasks = vec![task("a"), task("b")];
        let executor = RecordingExecutor::new(vec![ScriptedLaunch::exit(1)]);
        let audit = MemoryAuditSink::default();
        let sandbox = SandboxSettings::default();

        let summary = run_task_graph(&tasks, &executor, &audit, &options(&sandbox)).expect("run");
        assert_eq!(summary.failed_task.as_deref(), Some("a"));
        assert_eq!(executor.commands().len(), 1);
    }

    #[test]
    fn policy_blocked_command_fails_without_launching() {
        let mut leaky = task("a");
        leaky.tests = vec!["cat .env".to_string()];
        let executor = RecordingExecutor::default();
        let audit = MemoryAuditSink::default();
        let sandbox = SandboxSettings::default();
        let policy = PolicyCatalog::builtin()
            .resolve("default-balanced")
            .expect("resolve");
        let opts = OrchestratorOptions {
            policy: Some(&policy),
            ..options(&sandbox)
        };

        let summary = run_task_graph(&[leaky], &executor, &audit, &opts).expect("run");
        assert_eq!(summary.failed_task.as_deref(), Some("a"));
        assert_eq!(
            summary.failure_reason.as_deref(),
            Some("Denied by policy pattern: .env")
        );
        assert_eq!(executor.commands(), vec!["cat .env"]);
        assert!(executor.launches().is_empty());
    }

    #[test]
    fn cycle_still_runs_every_task_once() {
        let tasks = vec![task_with_deps("a", &["b"]), task_with_deps("b", &["a"])];
        let executor = RecordingExecutor::default();
        let audit = MemoryAuditSink::default();
        let sandbox = SandboxSettings::default();

        let summary = run_task_graph(&tasks, &executor, &audit, &options(&sandbox)).expect("run");
        assert!(summary.succeeded);
        assert_eq!(summary.completed_tasks, vec!["a", "b"]);
        assert_eq!(audit.kinds()[0], "build.order.cycle");
    }
}
