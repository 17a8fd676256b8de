//! Engine configuration stored under `.shipgate/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::project_state::write_atomic;

/// Engine configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Wall-clock bound for every spawned process, in seconds.
    pub command_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes per stream.
    pub output_limit_bytes: usize,

    /// Disposable image used for containerized commands.
    pub container_image: String,

    /// Mount point of the project root inside the container.
    pub container_workdir: String,

    /// Session retry budget restored after a successful ship.
    pub retry_budget: u32,

    /// Policy pack used for new projects.
    pub default_policy_pack: String,

    /// Run task commands for real. When false, builds simulate commands.
    pub execute_commands: bool,

    /// Relative path whose presence marks the project as hardened.
    pub hardening_marker: String,

    pub static_analysis: StaticAnalysisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StaticAnalysisConfig {
    pub enabled: bool,
    /// Treat tool failures as blockers rather than warnings.
    pub strict: bool,
    pub tools: Vec<StaticTool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StaticTool {
    pub name: String,
    pub command: String,
}

impl Default for StaticAnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strict: false,
            tools: vec![
                StaticTool {
                    name: "lint".to_string(),
                    command: "pnpm lint".to_string(),
                },
                StaticTool {
                    name: "semgrep".to_string(),
                    command: "semgrep scan --config auto .".to_string(),
                },
                StaticTool {
                    name: "gitleaks".to_string(),
                    command: "gitleaks detect --no-banner --source .".to_string(),
                },
            ],
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 120,
            output_limit_bytes: 100_000,
            container_image: "node:20-alpine".to_string(),
            container_workdir: "/workspace".to_string(),
            retry_budget: 2,
            default_policy_pack: "default-balanced".to_string(),
            execute_commands: false,
            hardening_marker: ".claude/settings.json".to_string(),
            static_analysis: StaticAnalysisConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.container_image.trim().is_empty() {
            return Err(anyhow!("container_image must be non-empty"));
        }
        if !self.container_workdir.starts_with('/') {
            return Err(anyhow!("container_workdir must be an absolute path"));
        }
        if self.default_policy_pack.trim().is_empty() {
            return Err(anyhow!("default_policy_pack must be non-empty"));
        }
        for tool in &self.static_analysis.tools {
            if tool.name.trim().is_empty() || tool.command.trim().is_empty() {
                return Err(anyhow!(
                    "static_analysis.tools entries need a name and a command"
                ));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write the default config unless one exists (or `force` is set).
///
/// Returns whether the file was written.
pub fn init_config(path: &Path, force: bool) -> Result<bool> {
    if path.exists() && !force {
        return Ok(false);
    }
    write_config(path, &EngineConfig::default())?;
    Ok(true)
}
