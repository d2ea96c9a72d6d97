//! Append-only audit log of authorization outcomes.
//!
//! Two sinks: [`MemoryAuditLog`] for tests and short-lived processes, and
//! [`SledAuditLog`] which persists entries under `audit/{identity}/{seq}` keys so a
//! single identity's history is one prefix scan.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

const AUDIT_DEFAULT_PATH: &str = "./data/audit";

/// Denial reasons recorded in the audit log. Never shown to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialClass {
    Unauthorized,
    LockedOut,
    RateLimited,
    ScopeDenied,
    PermissionDenied,
    /// The topic filter refused the request or withheld a composed answer.
    Restricted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied(DenialClass),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub identity: String,
    pub outcome: AuditOutcome,
    pub at: DateTime<Utc>,
}

pub trait AuditSink: Send + Sync {
    fn append(&self, identity: &str, outcome: AuditOutcome);

    /// Entries for one identity in append order.
    fn entries_for(&self, identity: &str) -> Vec<AuditEntry>;
}

#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    seq: AtomicU64,
    by_identity: DashMap<String, Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_identity.iter().map(|e| e.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemoryAuditLog {
    fn append(&self, identity: &str, outcome: AuditOutcome) {
        let entry = AuditEntry {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            identity: identity.to_string(),
            outcome,
            at: Utc::now(),
        };
        self.by_identity
            .entry(identity.to_string())
            .or_default()
            .push(entry);
    }

    fn entries_for(&self, identity: &str) -> Vec<AuditEntry> {
        self.by_identity
            .get(identity)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}

/// Sled-backed audit log on the host filesystem.
pub struct SledAuditLog {
    db: sled::Db,
}

impl SledAuditLog {
    pub fn open(path: Option<impl AsRef<Path>>) -> sled::Result<Self> {
        let p = path
            .map(|x| x.as_ref().to_path_buf())
            .unwrap_or_else(|| Path::new(AUDIT_DEFAULT_PATH).to_path_buf());
        let db = sled::open(p)?;
        Ok(Self { db })
    }

    fn prefix(identity: &str) -> String {
        format!("audit/{identity}/")
    }

    fn write(&self, identity: &str, outcome: AuditOutcome) -> Result<(), AuditWriteError> {
        let seq = self.db.generate_id()?;
        let entry = AuditEntry {
            seq,
            identity: identity.to_string(),
            outcome,
            at: Utc::now(),
        };
        // Zero-padded so lexical key order equals append order.
        let key = format!("{}{seq:020}", Self::prefix(identity));
        let value = serde_json::to_vec(&entry)?;
        self.db.insert(key.as_bytes(), value)?;
        Ok(())
    }

    pub fn flush(&self) -> sled::Result<usize> {
        self.db.flush()
    }
}

#[derive(Debug, thiserror::Error)]
enum AuditWriteError {
    #[error(transparent)]
    Sled(#[from] sled::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AuditSink for SledAuditLog {
    fn append(&self, identity: &str, outcome: AuditOutcome) {
        if let Err(e) = self.write(identity, outcome) {
            tracing::error!(target: "concierge::guard", identity = %identity, error = %e, "Audit write failed");
        }
    }

    fn entries_for(&self, identity: &str) -> Vec<AuditEntry> {
        self.db
            .scan_prefix(Self::prefix(identity).as_bytes())
            .filter_map(|r| r.ok())
            .filter_map(|(_, v)| serde_json::from_slice::<AuditEntry>(&v).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_log_keeps_append_order_per_identity() {
        let log = MemoryAuditLog::new();
        log.append("+1555", AuditOutcome::Denied(DenialClass::ScopeDenied));
        log.append("+1666", AuditOutcome::Allowed);
        log.append("+1555", AuditOutcome::Allowed);

        let entries = log.entries_for("+1555");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, AuditOutcome::Denied(DenialClass::ScopeDenied));
        assert!(entries[0].seq < entries[1].seq);
        assert_eq!(log.len(), 3);
        assert!(log.entries_for("+1777").is_empty());
    }

    #[test]
    fn sled_log_scans_by_identity() {
        let dir = tempfile::tempdir().unwrap();
        let log = SledAuditLog::open(Some(dir.path())).unwrap();
        log.append("+1555", AuditOutcome::Denied(DenialClass::LockedOut));
        log.append("+15550", AuditOutcome::Allowed);
        log.append("+1555", AuditOutcome::Allowed);
        log.flush().unwrap();

        let entries = log.entries_for("+1555");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, AuditOutcome::Denied(DenialClass::LockedOut));
        assert_eq!(entries[1].outcome, AuditOutcome::Allowed);
        assert_eq!(log.entries_for("+15550").len(), 1);
    }

    #[test]
    fn entry_serializes_reason_under_outcome() {
        let entry = AuditEntry {
            seq: 7,
            identity: "+1555".into(),
            outcome: AuditOutcome::Denied(DenialClass::RateLimited),
            at: Utc::now(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["outcome"]["denied"], "rate_limited");
        let allowed = serde_json::to_value(AuditOutcome::Allowed).unwrap();
        assert_eq!(allowed, "allowed");
    }
}
