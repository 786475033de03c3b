//! Audit trail collaborator.
//!
//! Components receive an [`AuditSink`] at construction and record every
//! mutation through it.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::program::ActorId;

/// One audited action.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub actor: Option<ActorId>,
    /// Short verb such as `program.create` or `snapshot.restore`.
    pub action: &'static str,
    /// What was acted on, e.g. a program id or snapshot id.
    pub subject: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        actor: Option<ActorId>,
        action: &'static str,
        subject: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            actor,
            action,
            subject: subject.into(),
            detail: detail.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Receives audit entries. Recording must never fail the caller.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Writes audit entries to the `flexotrack::audit` log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, entry: AuditEntry) {
        log::info!(
            target: "flexotrack::audit",
            "actor={} action={} subject={} {}",
            entry
                .actor
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
            entry.action,
            entry.subject,
            entry.detail
        );
    }
}

/// Keeps entries in memory; useful for tests and diagnostics.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn actions(&self) -> Vec<&'static str> {
        self.entries().iter().map(|e| e.action).collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        match self.entries.lock() {
            Ok(mut guard) => guard.push(entry),
            Err(poisoned) => {
                log::warn!("Audit sink lock was poisoned, recovering");
                poisoned.into_inner().push(entry);
            }
        }
    }
}
