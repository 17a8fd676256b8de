//! Policy packs: inheritance resolution and command permission matching.
//!
//! Packs form single-parent chains via `extends`. Resolution merges child over
//! parent with tightening-only semantics: a child can add restrictions and
//! shrink budgets but can never relax anything an ancestor requires.

use std::collections::{BTreeMap, HashSet};

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Permissions {
    pub deny: Vec<String>,
    pub ask: Vec<String>,
    pub allow: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffBudget {
    pub max_files: u32,
    pub max_lines: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskRules {
    pub require_security_review_on_high_risk: bool,
    pub max_high_risk_tasks: u32,
}

/// Named, inheritable bundle of command permission rules and risk limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyPack {
    pub name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    #[serde(default)]
    pub description: String,
    pub permissions: Permissions,
    pub diff_budget: DiffBudget,
    pub risk_rules: RiskRules,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("unknown policy pack: {0}")]
    UnknownPack(String),
    #[error("policy inheritance cycle detected: {0}")]
    InheritanceCycle(String),
}

/// Index of pack definitions keyed by name.
#[derive(Debug, Clone, Default)]
pub struct PolicyCatalog {
    packs: BTreeMap<String, PolicyPack>,
}

impl PolicyCatalog {
    pub fn from_packs(packs: impl IntoIterator<Item = PolicyPack>) -> Self {
        Self {
            packs: packs
                .into_iter()
                .map(|pack| (pack.name.clone(), pack))
                .collect(),
        }
    }

    /// Catalog with the packs shipped by default.
    pub fn builtin() -> Self {
        Self::from_packs([default_balanced_pack(), strict_pack()])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.packs.keys().map(String::as_str)
    }

    /// Resolve `name` into a fully merged, tightened pack.
    pub fn resolve(&self, name: &str) -> Result<PolicyPack, PolicyError> {
        let mut visiting = HashSet::new();
        self.resolve_inner(name, &mut visiting)
    }

    /// Every pack in the catalog, fully resolved (sorted by name).
    pub fn list(&self) -> Result<Vec<PolicyPack>, PolicyError> {
        self.names().map(|name| self.resolve(name)).collect()
    }

    fn resolve_inner(
        &self,
        name: &str,
        visiting: &mut HashSet<String>,
    ) -> Result<PolicyPack, PolicyError> {
        if visiting.contains(name) {
            return Err(PolicyError::InheritanceCycle(name.to_string()));
        }
        let current = self
            .packs
            .get(name)
            .ok_or_else(|| PolicyError::UnknownPack(name.to_string()))?;

        let Some(parent_name) = current.extends.as_deref() else {
            return Ok(current.clone());
        };

        visiting.insert(name.to_string());
        let parent = self.resolve_inner(parent_name, visiting)?;
        visiting.remove(name);

        Ok(tighten(&parent, current))
    }
}

/// Merge `child` over an already resolved `parent`.
fn tighten(parent: &PolicyPack, child: &PolicyPack) -> PolicyPack {
    PolicyPack {
        name: child.name.clone(),
        version: child.version.clone(),
        extends: child.extends.clone(),
        description: child.description.clone(),
        permissions: Permissions {
            deny: merge_unique(&parent.permissions.deny, &child.permissions.deny),
            ask: merge_unique(&parent.permissions.ask, &child.permissions.ask),
            allow: merge_unique(&parent.permissions.allow, &child.permissions.allow),
        },
        diff_budget: DiffBudget {
            max_files: parent.diff_budget.max_files.min(child.diff_budget.max_files),
            max_lines: parent.diff_budget.max_lines.min(child.diff_budget.max_lines),
        },
        risk_rules: RiskRules {
            require_security_review_on_high_risk: parent
                .risk_rules
                .require_security_review_on_high_risk
                || child.risk_rules.require_security_review_on_high_risk,
            max_high_risk_tasks: parent
                .risk_rules
                .max_high_risk_tasks
                .min(child.risk_rules.max_high_risk_tasks),
        },
    }
}

fn merge_unique(base: &[String], extra: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(base.len() + extra.len());
    for pattern in base.iter().chain(extra) {
        if !merged.contains(pattern) {
            merged.push(pattern.clone());
        }
    }
    merged
}

fn patterns(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn default_balanced_pack() -> PolicyPack {
    PolicyPack {
        name: "default-balanced".to_string(),
        version: "1.0.0".to_string(),
        extends: None,
        description: "Balanced policy pack for normal development".to_string(),
        permissions: Permissions {
            deny: patterns(&[".env", ".env.*", "secrets/**"]),
            ask: patterns(&["curl *", "wget *", "rm -rf *"]),
            allow: patterns(&["git status", "git diff", "pnpm test", "pnpm build"]),
        },
        diff_budget: DiffBudget {
            max_files: 12,
            max_lines: 500,
        },
        risk_rules: RiskRules {
            require_security_review_on_high_risk: true,
            max_high_risk_tasks: 3,
        },
    }
}

fn strict_pack() -> PolicyPack {
    PolicyPack {
        name: "strict".to_string(),
        version: "1.0.0".to_string(),
        extends: Some("default-balanced".to_string()),
        description: "Strict policy for enterprise-sensitive repos".to_string(),
        permissions: Permissions {
            deny: patterns(&["**/*.pem", "**/*.key", "**/id_rsa*"]),
            ask: patterns(&["git push *"]),
            allow: patterns(&["pnpm test:contract", "pnpm test:integration"]),
        },
        diff_budget: DiffBudget {
            max_files: 6,
            max_lines: 200,
        },
        risk_rules: RiskRules {
            require_security_review_on_high_risk: true,
            max_high_risk_tasks: 1,
        },
    }
}

/// Decision for a single command against a resolved pack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    /// Matched an `ask` pattern: needs approval.
    Ask { pattern: String },
    /// Matched a `deny` pattern: never runs.
    Deny { pattern: String },
}

impl PolicyDecision {
    pub fn reason(&self) -> Option<String> {
        match self {
            PolicyDecision::Allow => None,
            PolicyDecision::Ask { pattern } => {
                Some(format!("Requires approval by policy pattern: {pattern}"))
            }
            PolicyDecision::Deny { pattern } => Some(format!("Denied by policy pattern: {pattern}")),
        }
    }
}

/// Evaluate `command` against deny patterns first, then ask patterns.
pub fn evaluate_policy(command: &str, policy: Option<&PolicyPack>) -> PolicyDecision {
    let Some(policy) = policy else {
        return PolicyDecision::Allow;
    };
    if let Some(pattern) = first_match(command, &policy.permissions.deny) {
        return PolicyDecision::Deny { pattern };
    }
    if let Some(pattern) = first_match(command, &policy.permissions.ask) {
        return PolicyDecision::Ask { pattern };
    }
    PolicyDecision::Allow
}

fn first_match(command: &str, patterns: &[String]) -> Option<String> {
    patterns
        .iter()
        .find(|pattern| matches_pattern(command, pattern))
        .cloned()
}

/// Match a command against a `*` glob.
///
/// A command matches when the whole (trimmed) command matches the glob
/// case-insensitively, or when the whitespace-normalized command contains the
/// normalized pattern with its ` *` wildcards removed.
pub fn matches_pattern(command: &str, pattern: &str) -> bool {
    glob_matches(command.trim(), pattern.trim()) || loosely_contains(command, pattern)
}

fn glob_matches(command: &str, pattern: &str) -> bool {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    RegexBuilder::new(&format!("^{body}$"))
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
        .map(|re| re.is_match(command))
        .unwrap_or(false)
}

fn loosely_contains(command: &str, pattern: &str) -> bool {
    let normalized = normalize(pattern);
    let needle = normalized.strip_suffix(" *").unwrap_or(&normalized);
    if needle.is_empty() {
        return false;
    }
    normalize(command).contains(needle)
}

fn normalize(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
