//! Gated delivery workflow engine CLI.
//!
//! Operates on the project at `--root` (default: current directory). State
//! lives under `.shipgate/`; requirements lock and task graph under `docs/`.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};

use shipgate::controller::{BuildController, BuildHooks, BuildOutcome, Collaborators};
use shipgate::core::types::{SandboxProfile, SandboxProvider, SandboxSettings, WorkflowState};
use shipgate::exit_codes;
use shipgate::io::audit::JsonlAuditSink;
use shipgate::io::collaborators::{
    CommandStaticAnalyzer, JsonTaskGraphProvider, Sha256LockChecker,
};
use shipgate::io::config::{init_config, load_config};
use shipgate::io::policy_store::JsonSettingsMirror;
use shipgate::io::project_state::ProjectPaths;
use shipgate::io::sandbox::{SandboxExecutor, SystemLauncher};
use shipgate::logging;

#[derive(Parser)]
#[command(
    name = "shipgate",
    version,
    about = "Gated delivery workflow engine"
)]
struct Cli {
    /// Project root.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `.shipgate/config.toml` with defaults if missing.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    #[command(flatten)]
    Project(ProjectCommand),
}

#[derive(Subcommand)]
enum ProjectCommand {
    /// Print workflow state, execution target, policy pack and sandbox settings.
    Status,
    /// Run one build attempt.
    Build,
    /// Request a workflow transition.
    Transition {
        /// Target state, e.g. PRD_LOADED.
        state: WorkflowState,
    },
    /// Enter PAUSED, remembering the current phase.
    Pause,
    /// Leave PAUSED.
    Resume {
        /// Target state; defaults to the phase recorded at pause time.
        state: Option<WorkflowState>,
    },
    /// Policy pack commands.
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    /// Configure command isolation.
    Sandbox {
        #[arg(long)]
        enabled: bool,
        #[arg(long, value_enum, default_value = "docker")]
        provider: ProviderArg,
        #[arg(long, value_enum, default_value = "balanced")]
        profile: ProfileArg,
    },
    /// Select the execution target builds run against.
    Model { identity: String },
    /// Run one command through the policy-enforced executor.
    Exec {
        command: String,
        /// Decide policy but launch nothing.
        #[arg(long)]
        simulate: bool,
    },
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// List every pack, fully resolved.
    List,
    /// Resolve, snapshot and mirror a pack.
    Apply { name: String },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderArg {
    Docker,
    Podman,
    None,
}

impl From<ProviderArg> for SandboxProvider {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Docker => SandboxProvider::Docker,
            ProviderArg::Podman => SandboxProvider::Podman,
            ProviderArg::None => SandboxProvider::None,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ProfileArg {
    Strict,
    Balanced,
    Off,
}

impl From<ProfileArg> for SandboxProfile {
    fn from(arg: ProfileArg) -> Self {
        match arg {
            ProfileArg::Strict => SandboxProfile::Strict,
            ProfileArg::Balanced => SandboxProfile::Balanced,
            ProfileArg::Off => SandboxProfile::Off,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = ProjectPaths::new(&cli.root);
    match cli.command {
        Command::Init { force } => {
            if init_config(&paths.config_path, force)? {
                println!("wrote {}", paths.config_path.display());
            } else {
                println!("{} exists (use --force to overwrite)", paths.config_path.display());
            }
            Ok(exit_codes::OK)
        }
        Command::Project(command) => run_project(&cli.root, &paths, command),
    }
}

fn run_project(root: &Path, paths: &ProjectPaths, command: ProjectCommand) -> Result<i32> {
    let config = load_config(&paths.config_path)?;

    let docs = root.join("docs");
    let task_graph = JsonTaskGraphProvider::new(docs.join("task-graph.json"));
    let lock = Sha256LockChecker::new(&docs);
    let static_analysis = CommandStaticAnalyzer::new(
        root,
        config.static_analysis.clone(),
        config.command_timeout(),
        config.output_limit_bytes,
    );
    let executor = SandboxExecutor::new(
        SystemLauncher {
            image: config.container_image.clone(),
            container_workdir: config.container_workdir.clone(),
        },
        root,
        config.command_timeout(),
        config.output_limit_bytes,
    );
    let audit = JsonlAuditSink::new(&paths.audit_dir);

    let mut controller = BuildController::open(
        root,
        Collaborators {
            task_graph: &task_graph,
            lock: &lock,
            static_analysis: &static_analysis,
            executor: &executor,
            audit: &audit,
        },
        BuildHooks::default(),
    )?;

    match command {
        ProjectCommand::Status => {
            print_status(&controller);
            Ok(exit_codes::OK)
        }
        ProjectCommand::Build => {
            let outcome = controller.build()?;
            println!("{outcome}");
            Ok(build_exit_code(&outcome))
        }
        ProjectCommand::Transition { state } => {
            controller.transition(state)?;
            println!("{}", controller.state().state);
            Ok(exit_codes::OK)
        }
        ProjectCommand::Pause => {
            match controller.pause()? {
                Some(prior) => println!("Paused from {prior}."),
                None => println!("Already paused."),
            }
            Ok(exit_codes::OK)
        }
        ProjectCommand::Resume { state } => {
            let resumed = controller.resume(state)?;
            println!("Resumed to {resumed}.");
            Ok(exit_codes::OK)
        }
        ProjectCommand::Policy { command } => run_policy(&mut controller, root, command),
        ProjectCommand::Sandbox {
            enabled,
            provider,
            profile,
        } => {
            let sandbox = SandboxSettings {
                enabled,
                provider: provider.into(),
                profile: profile.into(),
            };
            controller.set_sandbox(sandbox)?;
            println!("sandbox {sandbox}");
            Ok(exit_codes::OK)
        }
        ProjectCommand::Model { identity } => {
            controller.select_model(&identity)?;
            println!("execution target {}", identity.trim());
            Ok(exit_codes::OK)
        }
        ProjectCommand::Exec { command, simulate } => {
            let result = controller.execute_command(&command, simulate)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(if result.blocked {
                exit_codes::BLOCKED
            } else if result.ok {
                exit_codes::OK
            } else {
                exit_codes::FAILED
            })
        }
    }
}

fn run_policy(controller: &mut BuildController<'_>, root: &Path, command: PolicyCommand) -> Result<i32> {
    match command {
        PolicyCommand::List => {
            for pack in controller.list_policies()? {
                println!("{}: {}", pack.name, pack.description);
            }
        }
        PolicyCommand::Apply { name } => {
            let mirror = JsonSettingsMirror::new(root.join(&controller.config().hardening_marker));
            let applied = controller.apply_policy(&name, &mirror)?;
            println!("Applied policy pack {} ({})", applied.pack.name, applied.hash);
        }
    }
    Ok(exit_codes::OK)
}

fn print_status(controller: &BuildController<'_>) {
    let state = controller.state();
    println!("state {}", state.state);
    println!(
        "execution target {}",
        state.execution_target.as_deref().unwrap_or("(none)")
    );
    println!("policy pack {}", state.policy_pack);
    println!("sandbox {}", state.sandbox);
    println!("retry budget {}", state.session.retry_budget);
    if let Some(reason) = &state.session.last_failure_reason {
        println!("last failure {reason}");
    }
}

fn build_exit_code(outcome: &BuildOutcome) -> i32 {
    match outcome {
        BuildOutcome::Shipped { .. } => exit_codes::OK,
        BuildOutcome::Failed { .. } => exit_codes::FAILED,
        BuildOutcome::ModelNotSelected
        | BuildOutcome::HashMismatch { .. }
        | BuildOutcome::GateBlocked { .. }
        | BuildOutcome::ReviewFailed { .. } => exit_codes::BLOCKED,
    }
}
