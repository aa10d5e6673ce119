//! Append-only audit trail
//!
//! One entry is written per mutating call and per sensitive read (backfeed
//! lookup, export). The core never reads entries back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RoundingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditActionType {
    Read,
    Create,
    Update,
    Delete,
    Export,
}

impl AuditActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditActionType::Read => "READ",
            AuditActionType::Create => "CREATE",
            AuditActionType::Update => "UPDATE",
            AuditActionType::Delete => "DELETE",
            AuditActionType::Export => "EXPORT",
        }
    }
}

/// Audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Human readable action name, e.g. "Create Patient"
    pub action: String,
    /// Acting user id
    pub user: String,
    pub action_type: AuditActionType,
    /// Visit key, item id, file name or a count
    pub affected_records: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    pub fn new(
        action: impl Into<String>,
        user: impl Into<String>,
        action_type: AuditActionType,
        affected_records: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            action: action.into(),
            user: user.into(),
            action_type,
            affected_records: affected_records.into(),
            details,
            timestamp: Utc::now(),
        }
    }
}

/// Write-only destination for audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> RoundingResult<()>;
}

/// Emits entries as structured events on the `audit` tracing target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, entry: AuditEntry) -> RoundingResult<()> {
        tracing::info!(
            target: "audit",
            action = %entry.action,
            user = %entry.user,
            action_type = entry.action_type.as_str(),
            affected = %logger_redacted::redact(&entry.affected_records),
            timestamp = %entry.timestamp.to_rfc3339(),
            "audit"
        );
        Ok(())
    }
}
