//! Audit trail for time stamp changes
//!
//! Each [`AuditEvent`] becomes one JSON line in the configured audit log
//! (`/var/log/credstamp/audit.log` by default):
//!
//! ```text
//! {"timestamp":"...","pid":4242,"event":"timestamp.refreshed","data":{"user":"alice",...}}
//! ```

use crate::config::schema::Config;
use crate::stamp::{Record, RecordKind, ScopeMode, StatusReason};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Something that changed, or should have changed, a user's time stamps
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum AuditEvent {
    /// A record was written after a successful authentication
    #[serde(rename = "timestamp.refreshed")]
    Refreshed {
        user: String,
        uid: u32,
        scope: ScopeMode,
        session_id: i32,
        record: RecordTarget,
        offset: Option<u64>,
    },
    /// Matching records were disabled in place
    #[serde(rename = "timestamp.invalidated")]
    Invalidated { user: String, scope: ScopeMode },
    /// The user's time stamp file was removed
    #[serde(rename = "timestamp.reset")]
    Reset { user: String },
    /// A record was disabled because its time could not be trusted
    #[serde(rename = "timestamp.tamper")]
    Tamper {
        user: String,
        scope: ScopeMode,
        reason: StatusReason,
    },
}

impl AuditEvent {
    /// Dotted event name as written to the log
    pub fn name(&self) -> &'static str {
        match self {
            Self::Refreshed { .. } => "timestamp.refreshed",
            Self::Invalidated { .. } => "timestamp.invalidated",
            Self::Reset { .. } => "timestamp.reset",
            Self::Tamper { .. } => "timestamp.tamper",
        }
    }

    pub fn user(&self) -> &str {
        match self {
            Self::Refreshed { user, .. }
            | Self::Invalidated { user, .. }
            | Self::Reset { user }
            | Self::Tamper { user, .. } => user,
        }
    }
}

/// What a refreshed record is bound to
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RecordTarget {
    Global,
    Ppid { pid: i32 },
    Tty { device: u64 },
}

impl From<&Record> for RecordTarget {
    fn from(record: &Record) -> Self {
        match record.kind {
            RecordKind::ParentProcess { pid, .. } => Self::Ppid { pid },
            RecordKind::Terminal { device, .. } => Self::Tty { device },
            RecordKind::Global | RecordKind::LeaderLock => Self::Global,
        }
    }
}

#[derive(Serialize)]
struct AuditEntry<'a> {
    timestamp: DateTime<Utc>,
    pid: u32,
    #[serde(flatten)]
    event: &'a AuditEvent,
}

/// Appends audit events to a JSON-lines file
pub struct AuditLog {
    enabled: bool,
    path: PathBuf,
}

impl AuditLog {
    /// Create a new audit logger from config
    pub fn new(config: &Config) -> Self {
        Self {
            enabled: config.general.audit_log,
            path: config.general.audit_log_path.clone(),
        }
    }

    /// Record an event.
    ///
    /// IO failures are reported with a warning and otherwise ignored, so a
    /// broken audit log never fails the command.
    pub async fn record(&self, event: &AuditEvent) {
        if !self.enabled {
            return;
        }

        let entry = AuditEntry {
            timestamp: Utc::now(),
            pid: std::process::id(),
            event,
        };
        let mut line = match serde_json::to_string(&entry) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to serialize {} event: {}", event.name(), e);
                return;
            }
        };
        line.push('\n');

        match self.append(&line).await {
            Ok(()) => debug!("Audited {} for {}", event.name(), event.user()),
            Err(e) => warn!("Failed to write audit log {}: {}", self.path.display(), e),
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.path)
            .await?;

        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
