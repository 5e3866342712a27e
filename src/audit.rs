//! Immutable audit logging.
//!
//! One entry is recorded per write, masked preview and decrypt attempt,
//! whatever the outcome. The log is append-only. Sinks are fallible: a sink
//! that cannot record an entry makes the triggering vault operation fail
//! closed.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AuditError;

/// What was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Write,
    ReadMasked,
    DecryptUser,
    DecryptAdmin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
}

/// Coarse failure classification. Never carries plaintext or key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidInput,
    PermissionDenied,
    NotFound,
    AuthenticationFailure,
    CryptoFailure,
    StorageFailure,
    UnsupportedSchema,
    Internal,
}

/// A permanent record of one access attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub action: AuditAction,
    pub actor_id: String,
    /// The anamnesis item the attempt targeted.
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: AuditOutcome,
    pub failure_reason: Option<FailureReason>,
}

impl AuditEntry {
    pub fn success(action: AuditAction, actor_id: &str, subject_id: &str) -> Self {
        Self {
            action,
            actor_id: actor_id.to_string(),
            subject_id: subject_id.to_string(),
            timestamp: Utc::now(),
            outcome: AuditOutcome::Success,
            failure_reason: None,
        }
    }

    pub fn failure(
        action: AuditAction,
        actor_id: &str,
        subject_id: &str,
        reason: FailureReason,
    ) -> Self {
        Self {
            outcome: AuditOutcome::Failure,
            failure_reason: Some(reason),
            ..Self::success(action, actor_id, subject_id)
        }
    }
}

/// A sink that receives audit entries. Implement this to forward entries
/// to a file, database or external audit service.
///
/// `append` must return only once the entry is durably recorded.
pub trait AuditSink: Send + Sync {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

/// An in-memory, append-only log of entries.
///
/// Forward sinks receive every entry first. If any forward sink fails, the
/// entry is not recorded locally either and the error is returned.
#[derive(Default)]
pub struct AuditLog {
    entries: Mutex<Vec<AuditEntry>>,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("entries", &self.len())
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to receive a copy of every entry. Configure sinks before
    /// the log is shared.
    pub fn with_forward_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.forward_sinks.push(sink);
        self
    }

    /// Number of recorded entries. A poisoned log reports zero.
    pub fn len(&self) -> usize {
        self.entries.lock().map_or(0, |entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every entry in append order.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for AuditLog {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        for sink in &self.forward_sinks {
            sink.append(entry)?;
        }
        self.entries
            .lock()
            .map_err(|_| AuditError::Poisoned)?
            .push(entry.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit entries as JSON lines (one per entry) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: Mutex<File>,
}

impl FileAuditSink {
    /// Open or create a file for append-only audit logging.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let line = serde_json::to_string(entry)?;
        let mut file = self.file.lock().map_err(|_| AuditError::Poisoned)?;
        writeln!(file, "{line}")?;
        file.sync_data()?;
        Ok(())
    }
}
