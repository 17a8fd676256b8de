//! Policy-enforced command execution, optionally inside a container.
//!
//! The [`ProcessLauncher`] trait decouples the decision logic in
//! [`SandboxExecutor`] from actually spawning `sh`/`docker`/`podman`. Tests
//! use scripted launchers that return predetermined outputs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::policy::{PolicyDecision, PolicyPack, evaluate_policy};
use crate::core::types::{ExecMode, ExecutionResult, SandboxProfile, SandboxProvider, SandboxSettings};
use crate::io::process::{CommandOutput, TIMEOUT_EXIT_CODE, run_command_with_timeout, shell_command};

/// Exit code reported when strict isolation cannot even start a container.
pub const CONTAINER_LAUNCH_EXIT_CODE: i32 = 125;

/// Parameters for a single process launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest<'a> {
    /// Project root; bind-mounted read-write for container runs.
    pub workdir: &'a Path,
    /// Command string interpreted by a shell.
    pub command: &'a str,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Output of a process that was launched (successfully or not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl LaunchOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }

    fn from_command_output(output: &CommandOutput) -> Self {
        Self {
            exit_code: output.exit_code(),
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            timed_out: output.timed_out,
        }
    }
}

/// Spawns processes on the host or in a container.
///
/// `Err` means the process could not be launched at all (tooling missing,
/// spawn failure). A launched process that fails is `Ok` with a non-zero exit.
pub trait ProcessLauncher {
    fn run_local(&self, request: &LaunchRequest<'_>) -> Result<LaunchOutput>;

    fn run_container(
        &self,
        provider: SandboxProvider,
        request: &LaunchRequest<'_>,
    ) -> Result<LaunchOutput>;
}

/// Launcher that uses the host shell and the provider's container CLI.
#[derive(Debug, Clone)]
pub struct SystemLauncher {
    /// Disposable image commands run in.
    pub image: String,
    /// Mount point of the project root inside the container.
    pub container_workdir: String,
}

impl ProcessLauncher for SystemLauncher {
    #[instrument(skip_all, fields(command = request.command))]
    fn run_local(&self, request: &LaunchRequest<'_>) -> Result<LaunchOutput> {
        let cmd = shell_command(request.command, request.workdir);
        let output = run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes)
            .context("run local command")?;
        Ok(LaunchOutput::from_command_output(&output))
    }

    #[instrument(skip_all, fields(provider = provider.as_str(), command = request.command))]
    fn run_container(
        &self,
        provider: SandboxProvider,
        request: &LaunchRequest<'_>,
    ) -> Result<LaunchOutput> {
        let mount = format!("{}:{}", request.workdir.display(), self.container_workdir);
        let mut cmd = std::process::Command::new(provider.as_str());
        cmd.args(["run", "--rm", "-v"])
            .arg(&mount)
            .arg("-w")
            .arg(&self.container_workdir)
            .arg(&self.image)
            .args(["sh", "-lc"])
            .arg(request.command)
            .current_dir(request.workdir);
        debug!(image = %self.image, mount = %mount, "starting container");
        let output = run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes)
            .with_context(|| format!("launch {} container", provider.as_str()))?;
        Ok(LaunchOutput::from_command_output(&output))
    }
}

/// Single-command execution surface used by the task orchestrator.
pub trait CommandExecutor {
    fn execute(
        &self,
        command: &str,
        sandbox: &SandboxSettings,
        policy: Option<&PolicyPack>,
        simulate: bool,
    ) -> ExecutionResult;
}

/// Applies policy decisions and sandbox rules before launching anything.
#[derive(Debug, Clone)]
pub struct SandboxExecutor<L> {
    launcher: L,
    project_root: PathBuf,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl<L: ProcessLauncher> SandboxExecutor<L> {
    pub fn new(
        launcher: L,
        project_root: impl Into<PathBuf>,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            launcher,
            project_root: project_root.into(),
            timeout,
            output_limit_bytes,
        }
    }

    pub fn launcher(&self) -> &L {
        &self.launcher
    }

    fn request<'a>(&'a self, command: &'a str) -> LaunchRequest<'a> {
        LaunchRequest {
            workdir: &self.project_root,
            command,
            timeout: self.timeout,
            output_limit_bytes: self.output_limit_bytes,
        }
    }

    fn execute_local(&self, command: &str) -> ExecutionResult {
        match self.launcher.run_local(&self.request(command)) {
            Ok(output) => {
                let reason = failure_reason(&output, "Command", self.timeout);
                launched_result(command, ExecMode::Local, output, reason)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "local launch failed");
                ExecutionResult {
                    ok: false,
                    blocked: false,
                    reason: Some(format!("Failed to launch command: {err:#}")),
                    mode: ExecMode::Local,
                    command: command.to_string(),
                    stdout: String::new(),
                    stderr: format!("{err:#}"),
                    exit_code: 127,
                    warnings: Vec::new(),
                }
            }
        }
    }

    fn execute_sandboxed(&self, command: &str, sandbox: &SandboxSettings) -> ExecutionResult {
        let strict = sandbox.profile == SandboxProfile::Strict;
        match self.launcher.run_container(sandbox.provider, &self.request(command)) {
            Ok(output) => {
                let label = format!("{} execution", sandbox.provider.as_str());
                let reason = failure_reason(&output, &label, self.timeout);
                let container = launched_result(command, ExecMode::Container, output, reason);
                if container.ok || strict {
                    return container;
                }
                let cause = container.reason.as_deref().unwrap_or("unknown");
                warn!(cause, "container execution failed, falling back to local");
                let mut fallback = self.execute_local(command);
                fallback.warnings = vec![format!(
                    "Container execution failed ({cause}), fell back to local execution"
                )];
                fallback
            }
            Err(err) => {
                let message = format!("{err:#}");
                if strict {
                    warn!(err = %message, "strict sandbox could not start container");
                    return ExecutionResult {
                        ok: false,
                        blocked: false,
                        reason: Some(format!(
                            "Strict sandbox requires container execution: {message}"
                        )),
                        mode: ExecMode::Container,
                        command: command.to_string(),
                        stdout: String::new(),
                        stderr: message,
                        exit_code: CONTAINER_LAUNCH_EXIT_CODE,
                        warnings: Vec::new(),
                    };
                }
                warn!(err = %message, "container unavailable, falling back to local");
                let mut fallback = self.execute_local(command);
                fallback.warnings = vec![format!(
                    "Container unavailable, fell back to local execution: {message}"
                )];
                fallback
            }
        }
    }
}

impl<L: ProcessLauncher> CommandExecutor for SandboxExecutor<L> {
    /// Decide and run a command.
    ///
    /// Order: deny, ask under strict profile, simulate, container with
    /// fallback, local. Deny and strict-ask block even when simulating.
    fn execute(
        &self,
        command: &str,
        sandbox: &SandboxSettings,
        policy: Option<&PolicyPack>,
        simulate: bool,
    ) -> ExecutionResult {
        let decision = evaluate_policy(command, policy);
        debug!(command, ?decision, simulate, "policy evaluated");

        if let PolicyDecision::Deny { .. } = decision {
            info!(command, "command denied by policy");
            return ExecutionResult::blocked(command, decision.reason().unwrap_or_default());
        }

        let needs_approval = matches!(decision, PolicyDecision::Ask { .. });
        if needs_approval && sandbox.profile == SandboxProfile::Strict {
            info!(command, "approval required under strict profile");
            return ExecutionResult::blocked(command, decision.reason().unwrap_or_default());
        }
        let approval_warnings: Vec<String> = decision.reason().into_iter().collect();

        if simulate {
            return ExecutionResult::simulated(command, approval_warnings);
        }

        let mut result = if sandbox.wants_container() {
            self.execute_sandboxed(command, sandbox)
        } else {
            self.execute_local(command)
        };
        result.warnings.extend(approval_warnings);
        result
    }
}

fn failure_reason(output: &LaunchOutput, label: &str, timeout: Duration) -> Option<String> {
    if output.timed_out {
        return Some(format!("{label} timed out after {}s", timeout.as_secs()));
    }
    if output.exit_code != 0 {
        return Some(format!("{label} failed with exit code {}", output.exit_code));
    }
    None
}

fn launched_result(
    command: &str,
    mode: ExecMode,
    output: LaunchOutput,
    reason: Option<String>,
) -> ExecutionResult {
    let exit_code = if output.timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        output.exit_code
    };
    ExecutionResult {
        ok: output.success(),
        blocked: false,
        reason,
        mode,
        command: command.to_string(),
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code,
        warnings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::policy::PolicyCatalog;
    use crate::test_support::{ScriptedLaunch, ScriptedLauncher};

    fn executor(launcher: ScriptedLauncher) -> SandboxExecutor<ScriptedLauncher> {
        SandboxExecutor::new(launcher, "/project", Duration::from_secs(5), 1_000)
    }

    fn settings(enabled: bool, provider: SandboxProvider, profile: SandboxProfile) -> SandboxSettings {
        SandboxSettings {
            enabled,
            provider,
            profile,
        }
    }

    fn balanced_docker() -> SandboxSettings {
        settings(true, SandboxProvider::Docker, SandboxProfile::Balanced)
    }

    fn strict_docker() -> SandboxSettings {
        settings(true, SandboxProvider::Docker, SandboxProfile::Strict)
    }

    fn builtin_policy() -> PolicyPack {
        PolicyCatalog::builtin()
            .resolve("default-balanced")
            .expect("resolve")
    }

    #[test]
    fn deny_blocks_even_when_simulating_with_sandbox_disabled() {
        let exec = executor(ScriptedLauncher::default());
        let policy = builtin_policy();
        let result = exec.execute("cat .env", &SandboxSettings::default(), Some(&policy), true);
        assert!(result.blocked);
        assert!(!result.ok);
        assert_eq!(result.exit_code, ExecutionResult::BLOCKED_EXIT_CODE);
        assert_eq!(result.reason.as_deref(), Some("Denied by policy pattern: .env"));
        assert!(exec.launcher().calls().is_empty());
    }

    #[test]
    fn ask_blocks_under_strict_profile() {
        let exec = executor(ScriptedLauncher::default());
        let policy = builtin_policy();
        let result = exec.execute("curl https://x", &strict_docker(), Some(&policy), false);
        assert!(result.blocked);
        assert!(exec.launcher().calls().is_empty());
    }

    #[test]
    fn ask_warns_when_simulating_under_balanced_profile() {
        let exec = executor(ScriptedLauncher::default());
        let policy = builtin_policy();
        let result = exec.execute("curl https://x", &balanced_docker(), Some(&policy), true);
        assert!(result.ok);
        assert!(!result.blocked);
        assert_eq!(result.mode, ExecMode::Simulated);
        assert_eq!(
            result.warnings,
            vec!["Requires approval by policy pattern: curl *"]
        );
    }

    #[test]
    fn ask_warning_survives_container_execution() {
        let exec = executor(ScriptedLauncher::new(vec![ScriptedLaunch::exit(0)]));
        let policy = builtin_policy();
        let result = exec.execute("curl https://x", &balanced_docker(), Some(&policy), false);
        assert!(result.ok);
        assert_eq!(result.mode, ExecMode::Container);
        assert_eq!(
            result.warnings,
            vec!["Requires approval by policy pattern: curl *"]
        );
        assert_eq!(exec.launcher().calls(), vec!["container:docker:curl https://x"]);
    }

    #[test]
    fn ask_warning_follows_fallback_warning() {
        let exec = executor(ScriptedLauncher::new(vec![
            ScriptedLaunch::exit(2),
            ScriptedLaunch::exit(0),
        ]));
        let policy = builtin_policy();
        let result = exec.execute("curl https://x", &balanced_docker(), Some(&policy), false);
        assert!(result.ok);
        assert_eq!(result.mode, ExecMode::Local);
        assert_eq!(result.warnings.len(), 2);
        assert!(result.warnings[0].contains("fell back to local execution"));
        assert!(result.warnings[0].contains("docker execution failed with exit code 2"));
        assert_eq!(
            result.warnings[1],
            "Requires approval by policy pattern: curl *"
        );
        assert_eq!(
            exec.launcher().calls(),
            vec!["container:docker:curl https://x", "local:curl https://x"]
        );
    }

    #[test]
    fn simulate_runs_nothing() {
        let exec = executor(ScriptedLauncher::default());
        let result = exec.execute("pnpm test", &balanced_docker(), None, true);
        assert!(result.ok);
        assert_eq!(result.mode, ExecMode::Simulated);
        assert!(exec.launcher().calls().is_empty());
    }

    #[test]
    fn container_success_is_returned() {
        let exec = executor(ScriptedLauncher::new(vec![ScriptedLaunch::exit(0)]));
        let result = exec.execute("pnpm test", &balanced_docker(), None, false);
        assert!(result.ok);
        assert_eq!(result.mode, ExecMode::Container);
        assert_eq!(exec.launcher().calls(), vec!["container:docker:pnpm test"]);
    }

    #[test]
    fn strict_container_failure_is_returned_verbatim() {
        let exec = executor(ScriptedLauncher::new(vec![ScriptedLaunch::exit(2)]));
        let result = exec.execute("pnpm test", &strict_docker(), None, false);
        assert!(!result.ok);
        assert!(!result.blocked);
        assert_eq!(result.mode, ExecMode::Container);
        assert_eq!(result.exit_code, 2);
        assert_eq!(
            result.reason.as_deref(),
            Some("docker execution failed with exit code 2")
        );
        assert_eq!(exec.launcher().calls().len(), 1);
    }

    #[test]
    fn balanced_container_failure_falls_back_to_local_with_warning() {
        let exec = executor(ScriptedLauncher::new(vec![
            ScriptedLaunch::exit(2),
            ScriptedLaunch::exit(0),
        ]));
        let result = exec.execute("pnpm test", &balanced_docker(), None, false);
        assert!(result.ok);
        assert_eq!(result.mode, ExecMode::Local);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("docker execution failed with exit code 2"));
        assert_eq!(
            exec.launcher().calls(),
            vec!["container:docker:pnpm test", "local:pnpm test"]
        );
    }

    #[test]
    fn strict_launch_failure_never_degrades() {
        let exec = executor(ScriptedLauncher::new(vec![ScriptedLaunch::launch_error(
            "docker: not found",
        )]));
        let result = exec.execute("pnpm test", &strict_docker(), None, false);
        assert!(!result.ok);
        assert_eq!(result.mode, ExecMode::Container);
        assert_eq!(result.exit_code, CONTAINER_LAUNCH_EXIT_CODE);
        assert!(
            result
                .reason
                .as_deref()
                .is_some_and(|r| r.starts_with("Strict sandbox requires container execution"))
        );
        assert_eq!(exec.launcher().calls().len(), 1);
    }

    #[test]
    fn balanced_launch_failure_falls_back_to_local() {
        let exec = executor(ScriptedLauncher::new(vec![
            ScriptedLaunch::launch_error("podman: not found"),
            ScriptedLaunch::exit(0),
        ]));
        let sandbox = settings(true, SandboxProvider::Podman, SandboxProfile::Balanced);
        let result = exec.execute("pnpm test", &sandbox, None, false);
        assert!(result.ok);
        assert_eq!(result.mode, ExecMode::Local);
        assert!(result.warnings[0].starts_with("Container unavailable, fell back to local execution"));
        assert!(result.warnings[0].contains("podman: not found"));
    }

    #[test]
    fn disabled_or_off_sandbox_runs_locally() {
        for sandbox in [
            settings(false, SandboxProvider::Docker, SandboxProfile::Strict),
            settings(true, SandboxProvider::None, SandboxProfile::Strict),
            settings(true, SandboxProvider::Docker, SandboxProfile::Off),
        ] {
            let exec = executor(ScriptedLauncher::new(vec![ScriptedLaunch::exit(1)]));
            let result = exec.execute("pnpm test", &sandbox, None, false);
            assert_eq!(result.mode, ExecMode::Local);
            assert!(!result.ok);
            assert_eq!(
                result.reason.as_deref(),
                Some("Command failed with exit code 1")
            );
            assert_eq!(exec.launcher().calls(), vec!["local:pnpm test"]);
        }
    }

    #[test]
    fn timeout_counts_as_failure() {
        let exec = executor(ScriptedLauncher::new(vec![ScriptedLaunch::timeout()]));
        let result = exec.execute("sleep 100", &SandboxSettings::default(), None, false);
        assert!(!result.ok);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert_eq!(result.reason.as_deref(), Some("Command timed out after 5s"));
    }

    #[cfg(unix)]
    #[test]
    fn system_launcher_runs_host_commands() {
        let temp = tempfile::tempdir().expect("tempdir");
        let exec = SandboxExecutor::new(
            SystemLauncher {
                image: "alpine:3".to_string(),
                container_workdir: "/workspace".to_string(),
            },
            temp.path(),
            Duration::from_secs(10),
            1_000,
        );
        let result = exec.execute("echo hello", &SandboxSettings::default(), None, false);
        assert!(result.ok, "{result:?}");
        assert_eq!(result.mode, ExecMode::Local);
        assert_eq!(result.stdout.trim(), "hello");
    }
}
