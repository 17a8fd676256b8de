//! Adapters for the collaborators a build attempt consumes: the task graph,
//! the requirements lock and static analysis.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::types::{Task, TaskGraph};
use crate::io::config::StaticAnalysisConfig;
use crate::io::process::{run_command_with_timeout, shell_command};

/// Supplies the flattened task list for a build attempt.
pub trait TaskGraphProvider {
    fn tasks(&self) -> Result<Vec<Task>>;
}

/// Reads `docs/task-graph.json`-style files.
#[derive(Debug, Clone)]
pub struct JsonTaskGraphProvider {
    path: PathBuf,
}

impl JsonTaskGraphProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TaskGraphProvider for JsonTaskGraphProvider {
    fn tasks(&self) -> Result<Vec<Task>> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read task graph {}", self.path.display()))?;
        let graph: TaskGraph = serde_json::from_str(&raw)
            .with_context(|| format!("parse task graph {}", self.path.display()))?;
        let tasks = graph.flatten();
        debug!(count = tasks.len(), "task graph loaded");
        Ok(tasks)
    }
}

/// Verdict of comparing current requirements with the locked hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockVerdict {
    pub valid: bool,
    pub expected: String,
    pub actual: String,
}

/// Requirements lock checks.
pub trait LockChecker {
    /// Lock artifacts exist.
    fn has_lock(&self) -> bool;

    fn verify(&self) -> Result<LockVerdict>;
}

/// Files hashed, in this (sorted) order, to fingerprint locked requirements.
const LOCK_HASH_SCOPE: [&str; 3] = ["assumptions.md", "decisions.md", "prd.locked.md"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockFile {
    prd_hash: String,
}

/// Compares a SHA-256 over the canonicalized docs in scope against
/// `prdHash` in `docs/prd.lock.json`.
#[derive(Debug, Clone)]
pub struct Sha256LockChecker {
    docs_dir: PathBuf,
}

impl Sha256LockChecker {
    pub fn new(docs_dir: impl Into<PathBuf>) -> Self {
        Self {
            docs_dir: docs_dir.into(),
        }
    }

    fn lock_path(&self) -> PathBuf {
        self.docs_dir.join("prd.lock.json")
    }

    /// Hash of the requirements documents as they are now.
    pub fn current_hash(&self) -> Result<String> {
        let mut sections = Vec::with_capacity(LOCK_HASH_SCOPE.len());
        for name in LOCK_HASH_SCOPE {
            let path = self.docs_dir.join(name);
            let raw = if path.exists() {
                fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?
            } else {
                String::new()
            };
            sections.push(format!("{name}\n{}", canonicalize(&raw)));
        }
        let mut hasher = Sha256::new();
        hasher.update(sections.join("\n---\n").as_bytes());
        Ok(hex::encode(hasher.finalize()))
    }
}

impl LockChecker for Sha256LockChecker {
    fn has_lock(&self) -> bool {
        self.lock_path().exists()
    }

    fn verify(&self) -> Result<LockVerdict> {
        let lock_path = self.lock_path();
        let raw = fs::read_to_string(&lock_path)
            .with_context(|| format!("read lock {}", lock_path.display()))?;
        let lock: LockFile = serde_json::from_str(&raw)
            .with_context(|| format!("parse lock {}", lock_path.display()))?;
        let actual = self.current_hash()?;
        Ok(LockVerdict {
            valid: lock.prd_hash == actual,
            expected: lock.prd_hash,
            actual,
        })
    }
}

/// Normalize line endings, tabs and trailing whitespace before hashing.
fn canonicalize(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\t', "  ")
        .lines()
        .map(str::trim_end)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Passed,
    Failed,
    Skipped,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaticToolReport {
    pub tool: String,
    pub status: ToolStatus,
    pub details: String,
    pub exit_code: i32,
}

/// Static analysis verdicts. Only `blockers` and `warnings` drive the build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StaticAnalysisSummary {
    pub reports: Vec<StaticToolReport>,
    pub blockers: Vec<String>,
    pub warnings: Vec<String>,
}

pub trait StaticAnalyzer {
    fn analyze(&self) -> Result<StaticAnalysisSummary>;
}

/// Exit code shells use for "command not found".
const COMMAND_NOT_FOUND: i32 = 127;

/// Runs the configured tool commands in the project root.
#[derive(Debug, Clone)]
pub struct CommandStaticAnalyzer {
    root: PathBuf,
    config: StaticAnalysisConfig,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandStaticAnalyzer {
    pub fn new(
        root: &Path,
        config: StaticAnalysisConfig,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            config,
            timeout,
            output_limit_bytes,
        }
    }
}

impl StaticAnalyzer for CommandStaticAnalyzer {
    fn analyze(&self) -> Result<StaticAnalysisSummary> {
        let mut summary = StaticAnalysisSummary::default();
        if !self.config.enabled {
            summary.reports.push(StaticToolReport {
                tool: "static-analysis".to_string(),
                status: ToolStatus::Skipped,
                details: "static analysis disabled in config".to_string(),
                exit_code: 0,
            });
            return Ok(summary);
        }

        for tool in &self.config.tools {
            let cmd = shell_command(&tool.command, &self.root);
            let output = match run_command_with_timeout(cmd, self.timeout, self.output_limit_bytes)
            {
                Ok(output) => output,
                Err(err) => {
                    warn!(tool = %tool.name, err = %format!("{err:#}"), "static analysis tool failed to start");
                    summary.reports.push(StaticToolReport {
                        tool: tool.name.clone(),
                        status: ToolStatus::Unavailable,
                        details: format!("{err:#}"),
                        exit_code: COMMAND_NOT_FOUND,
                    });
                    summary.warnings.push(format!("{} unavailable", tool.name));
                    continue;
                }
            };

            if output.success() {
                summary.reports.push(StaticToolReport {
                    tool: tool.name.clone(),
                    status: ToolStatus::Passed,
                    details: "ok".to_string(),
                    exit_code: 0,
                });
                continue;
            }

            if output.exit_code() == COMMAND_NOT_FOUND {
                summary.reports.push(StaticToolReport {
                    tool: tool.name.clone(),
                    status: ToolStatus::Unavailable,
                    details: format!("{} not found", tool.command),
                    exit_code: COMMAND_NOT_FOUND,
                });
                summary.warnings.push(format!("{} unavailable", tool.name));
                continue;
            }

            let details = first_non_empty(&[
                output.stderr_lossy(),
                output.stdout_lossy(),
                format!("{} failed", tool.command),
            ]);
            let message = format!("{} failed: {}", tool.name, details);
            summary.reports.push(StaticToolReport {
                tool: tool.name.clone(),
                status: ToolStatus::Failed,
                details,
                exit_code: output.exit_code(),
            });
            if self.config.strict {
                summary.blockers.push(message);
            } else {
                summary.warnings.push(message);
            }
        }

        Ok(summary)
    }
}

fn first_non_empty(candidates: &[String]) -> String {
    candidates
        .iter()
        .map(|c| c.trim())
        .find(|c| !c.is_empty())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::StaticTool;

    #[test]
    fn json_provider_flattens_graph() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("task-graph.json");
        fs::write(
            &path,
            r#"{"version":"1.2","epics":[{"id":"e","stories":[{"id":"s","tasks":[
                {"id":"a","risk":"low","tests":["cargo test"]},
                {"id":"b","risk":"high","dependsOn":["a"]}
            ]}]}]}"#,
        )
        .expect("write");
        let tasks = JsonTaskGraphProvider::new(&path).tasks().expect("tasks");
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].depends_on, vec!["a"]);
    }

    #[test]
    fn lock_checker_detects_drift() {
        let temp = tempfile::tempdir().expect("tempdir");
        let docs = temp.path().join("docs");
        fs::create_dir_all(&docs).expect("docs");
        fs::write(docs.join("prd.locked.md"), "# PRD\r\nship it  \n").expect("prd");
        let checker = Sha256LockChecker::new(&docs);
        assert!(!checker.has_lock());

        let hash = checker.current_hash().expect("hash");
        fs::write(
            docs.join("prd.lock.json"),
            format!(r#"{{"version":"1.2","prdHash":"{hash}"}}"#),
        )
        .expect("lock");
        assert!(checker.has_lock());
        assert!(checker.verify().expect("verify").valid);

        // Whitespace-only edits are canonicalized away.
        fs::write(docs.join("prd.locked.md"), "# PRD\nship it\n\n").expect("prd");
        assert!(checker.verify().expect("verify").valid);

        fs::write(docs.join("prd.locked.md"), "# PRD\nship it later\n").expect("prd");
        let verdict = checker.verify().expect("verify");
        assert!(!verdict.valid);
        assert_eq!(verdict.expected, hash);
        assert_ne!(verdict.actual, hash);
    }

    #[test]
    fn disabled_analysis_reports_skipped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let analyzer = CommandStaticAnalyzer::new(
            temp.path(),
            StaticAnalysisConfig::default(),
            Duration::from_secs(5),
            1_000,
        );
        let summary = analyzer.analyze().expect("analyze");
        assert_eq!(summary.reports.len(), 1);
        assert_eq!(summary.reports[0].status, ToolStatus::Skipped);
        assert!(summary.blockers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn strict_analysis_turns_failures_into_blockers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = StaticAnalysisConfig {
            enabled: true,
            strict: true,
            tools: vec![
                StaticTool {
                    name: "ok".to_string(),
                    command: "true".to_string(),
                },
                StaticTool {
                    name: "lint".to_string(),
                    command: "echo 'bad style' >&2; exit 1".to_string(),
                },
                StaticTool {
                    name: "ghost".to_string(),
                    command: "definitely-not-a-real-tool-xyz".to_string(),
                },
            ],
        };
        let analyzer =
            CommandStaticAnalyzer::new(temp.path(), config, Duration::from_secs(10), 1_000);
        let summary = analyzer.analyze().expect("analyze");
        let statuses: Vec<ToolStatus> = summary.reports.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![ToolStatus::Passed, ToolStatus::Failed, ToolStatus::Unavailable]
        );
        assert_eq!(summary.blockers, vec!["lint failed: bad style"]);
        assert_eq!(summary.warnings, vec!["ghost unavailable"]);
    }
}
