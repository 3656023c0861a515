//! Metadata audit logging.
//!
//! An [`AuditEvent`] is built only from [`FieldLabels`] and an
//! [`AuditAction`]; it has no slot for plaintext, ciphertext, iv, tag or key
//! material, so none can reach an audit sink.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::storage::{FieldLabels, Sensitivity};

/// Operation performed on a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Store,
    Retrieve,
    Update,
    Delete,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditAction::Store => f.write_str("store"),
            AuditAction::Retrieve => f.write_str("retrieve"),
            AuditAction::Update => f.write_str("update"),
            AuditAction::Delete => f.write_str("delete"),
        }
    }
}

/// One audit line: who, what kind of field, which action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub user_id: i64,
    pub category: String,
    pub field_name: String,
    pub sensitivity: Sensitivity,
    pub action: AuditAction,
}

impl AuditEvent {
    pub fn new(labels: &FieldLabels, action: AuditAction) -> Self {
        Self {
            user_id: labels.owner_id,
            category: labels.category.clone(),
            field_name: labels.field_name.clone(),
            sensitivity: labels.sensitivity,
            action,
        }
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "User {} | Category {} | Field {} | Sensitivity {} | Action {}",
            self.user_id, self.category, self.field_name, self.sensitivity, self.action
        )
    }
}

/// Receives audit events. Called once per completed operation.
pub trait MetadataLogger: Send + Sync {
    fn record(&self, event: &AuditEvent);
}

/// Default logger: one structured `tracing` event per audit line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetadataLogger;

impl MetadataLogger for TracingMetadataLogger {
    fn record(&self, event: &AuditEvent) {
        info!(
            target: "pii_audit",
            user_id = event.user_id,
            category = %event.category,
            field_name = %event.field_name,
            sensitivity = %event.sensitivity,
            action = %event.action,
            "{}",
            event
        );
    }
}

/// Writes audit events as JSON lines (one per event) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct JsonLinesMetadataLogger {
    file: Mutex<File>,
}

impl JsonLinesMetadataLogger {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl MetadataLogger for JsonLinesMetadataLogger {
    fn record(&self, event: &AuditEvent) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit event");
                return;
            }
        };
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
            warn!(error = %e, "failed to append audit event");
        }
    }
}

/// Keeps rendered audit lines in memory.
#[derive(Debug, Default)]
pub struct MemoryMetadataLogger {
    lines: Mutex<Vec<String>>,
}

impl MemoryMetadataLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl MetadataLogger for MemoryMetadataLogger {
    fn record(&self, event: &AuditEvent) {
        self.lines.lock().push(event.to_string());
    }
}
