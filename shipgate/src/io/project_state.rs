//! Persisted project state (`.shipgate/state.json`) and the per-project lock.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{SandboxSettings, WorkflowState};

pub const STATE_VERSION: u32 = 1;
pub const DEFAULT_RETRY_BUDGET: u32 = 2;

/// All canonical paths within `.shipgate/` for a project root.
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state_dir: PathBuf,
    pub state_path: PathBuf,
    pub config_path: PathBuf,
    pub policy_path: PathBuf,
    pub audit_dir: PathBuf,
    pub lock_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let state_dir = root.join(".shipgate");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            state_path: state_dir.join("state.json"),
            config_path: state_dir.join("config.toml"),
            policy_path: state_dir.join("policy-pack.json"),
            audit_dir: state_dir.join("audit"),
            lock_path: state_dir.join("project.lock"),
        }
    }
}

/// Session bookkeeping carried across build attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Session {
    pub current_task_id: Option<String>,
    pub paused_at: Option<String>,
    /// Phase recorded when entering PAUSED; the default resume target.
    pub last_active_state: Option<WorkflowState>,
    pub checkpoint_id: Option<String>,
    pub last_failure_reason: Option<String>,
    pub retry_budget: u32,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            current_task_id: None,
            paused_at: None,
            last_active_state: None,
            checkpoint_id: None,
            last_failure_reason: None,
            retry_budget: DEFAULT_RETRY_BUDGET,
        }
    }
}

/// The single authoritative record of a project's workflow position.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectState {
    pub version: u32,
    pub state: WorkflowState,
    /// Explicitly selected execution target (model/executor identity).
    #[serde(default)]
    pub execution_target: Option<String>,
    /// Name of the policy pack used when no snapshot has been applied.
    pub policy_pack: String,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub session: Session,
}

impl ProjectState {
    pub fn new(policy_pack: &str) -> Self {
        Self {
            version: STATE_VERSION,
            state: WorkflowState::Idle,
            execution_target: None,
            policy_pack: policy_pack.to_string(),
            sandbox: SandboxSettings::default(),
            session: Session::default(),
        }
    }
}

/// Load project state from disk.
pub fn load_project_state(path: &Path) -> Result<ProjectState> {
    debug!(path = %path.display(), "loading project state");
    let contents = fs::read_to_string(path)
        .with_context(|| format!("read project state {}", path.display()))?;
    let state: ProjectState = serde_json::from_str(&contents)
        .with_context(|| format!("parse project state {}", path.display()))?;
    if state.version != STATE_VERSION {
        return Err(anyhow!(
            "unsupported project state version {} in {}",
            state.version,
            path.display()
        ));
    }
    debug!(state = %state.state, "project state loaded");
    Ok(state)
}

/// Atomically write project state to disk (temp file + rename).
pub fn write_project_state(path: &Path, state: &ProjectState) -> Result<()> {
    debug!(path = %path.display(), state = %state.state, "writing project state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Exclusive per-project lock; released when dropped.
///
/// Only one controller may mutate a project's state at a time.
#[derive(Debug)]
pub struct ProjectLock {
    path: PathBuf,
}

impl ProjectLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(anyhow!(
                    "project is locked by another run ({}); remove it if no run is active",
                    path.display()
                ));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("create lock {}", path.display()));
            }
        };
        writeln!(file, "{}", std::process::id())
            .with_context(|| format!("write lock {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ProjectLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!(err = %err, path = %self.path.display(), "failed to release project lock");
        }
    }
}
