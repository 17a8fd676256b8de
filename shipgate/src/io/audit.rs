//! Structured audit events for transitions, tasks, policy and gate decisions.
//!
//! Audit events are product output: they are always recorded, independent of
//! `RUST_LOG`. The JSONL sink writes one file per UTC day under
//! `.shipgate/audit/`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts: String,
    pub level: AuditLevel,
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl AuditEvent {
    pub fn new(level: AuditLevel, kind: &str, message: &str, data: Value) -> Self {
        Self {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            level,
            kind: kind.to_string(),
            message: message.to_string(),
            data,
        }
    }
}

/// Destination for audit events.
pub trait AuditSink {
    fn record(&self, event: AuditEvent) -> Result<()>;

    fn info(&self, kind: &str, message: &str, data: Value) -> Result<()> {
        self.record(AuditEvent::new(AuditLevel::Info, kind, message, data))
    }

    fn warn(&self, kind: &str, message: &str, data: Value) -> Result<()> {
        self.record(AuditEvent::new(AuditLevel::Warn, kind, message, data))
    }

    fn error(&self, kind: &str, message: &str, data: Value) -> Result<()> {
        self.record(AuditEvent::new(AuditLevel::Error, kind, message, data))
    }
}

/// Appends events to `<dir>/YYYY-MM-DD.jsonl`.
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    dir: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn today_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", Utc::now().format("%Y-%m-%d")))
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: AuditEvent) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create audit dir {}", self.dir.display()))?;
        let path = self.today_path();
        let mut line = serde_json::to_string(&event).context("serialize audit event")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open audit log {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append audit log {}", path.display()))?;
        debug!(kind = %event.kind, level = ?event.level, "audit event recorded");
        Ok(())
    }
}
