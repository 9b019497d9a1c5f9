//! Idempotency guard keyed by event id.
//!
//! Admission is a single check-and-set on the record map, so two concurrent
//! submissions of one id can never both proceed. Records are kept for the
//! lifetime of the guard.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fd_common::EventStatus;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    InProgress,
    Succeeded,
    Failed,
}

impl From<EventStatus> for RecordStatus {
    fn from(status: EventStatus) -> Self {
        match status {
            EventStatus::Routed => RecordStatus::Succeeded,
            EventStatus::DeadLettered => RecordStatus::Failed,
            // A duplicate never owns the record; leave it as the first submission left it.
            EventStatus::Duplicate => RecordStatus::InProgress,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordStatus::InProgress => "IN_PROGRESS",
            RecordStatus::Succeeded => "SUCCEEDED",
            RecordStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyRecord {
    pub status: RecordStatus,
    /// SHA-256 of the raw payload, when admitted with one
    pub fingerprint: Option<String>,
    pub first_seen: DateTime<Utc>,
}

/// Admission decision for one submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; the caller owns this id now
    Proceed,
    /// The id was admitted before
    AlreadyProcessed { status: RecordStatus },
    /// The id was admitted before with a different payload
    Conflict,
}

#[derive(Debug, Default)]
pub struct IdempotencyGuard {
    records: DashMap<String, IdempotencyRecord>,
    size: AtomicUsize,
    duplicates: AtomicU64,
    conflicts: AtomicU64,
    /// Log once when the record count reaches this
    warn_threshold: Option<usize>,
}

impl IdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_warn_threshold(threshold: usize) -> Self {
        Self {
            warn_threshold: Some(threshold),
            ..Self::default()
        }
    }

    /// Record `id` if unseen
    pub fn admit(&self, id: &str) -> Admission {
        self.admit_inner(id, None)
    }

    /// Record `id` along with a payload fingerprint. A later submission of the
    /// same id with a different payload is a `Conflict`.
    pub fn admit_with_fingerprint(&self, id: &str, payload: &str) -> Admission {
        self.admit_inner(id, Some(fingerprint(payload)))
    }

    fn admit_inner(&self, id: &str, fingerprint: Option<String>) -> Admission {
        let admission = match self.records.entry(id.to_string()) {
            Entry::Occupied(existing) => {
                let record = existing.get();
                match (&record.fingerprint, &fingerprint) {
                    (Some(seen), Some(given)) if seen != given => Admission::Conflict,
                    _ => Admission::AlreadyProcessed { status: record.status },
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(IdempotencyRecord {
                    status: RecordStatus::InProgress,
                    fingerprint,
                    first_seen: Utc::now(),
                });
                Admission::Proceed
            }
        };

        match &admission {
            Admission::Proceed => {
                let size = self.size.fetch_add(1, Ordering::SeqCst) + 1;
                if self.warn_threshold == Some(size) {
                    warn!(records = size, "Idempotency records reached warning threshold");
                }
            }
            Admission::AlreadyProcessed { status } => {
                self.duplicates.fetch_add(1, Ordering::SeqCst);
                debug!(event_id = %id, %status, "Duplicate submission");
            }
            Admission::Conflict => {
                self.conflicts.fetch_add(1, Ordering::SeqCst);
                warn!(event_id = %id, "Event id reused with a different payload");
            }
        }
        admission
    }

    /// Record the final status of an admitted id
    pub fn complete(&self, id: &str, status: RecordStatus) {
        if let Some(mut record) = self.records.get_mut(id) {
            record.status = status;
        }
    }

    pub fn status(&self, id: &str) -> Option<RecordStatus> {
        self.records.get(id).map(|r| r.status)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates.load(Ordering::SeqCst)
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::SeqCst)
    }
}

/// Hex SHA-256 of a payload
pub fn fingerprint(payload: &str) -> String {
    hex::encode(Sha256::digest(payload.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_admission_is_duplicate() {
        let guard = IdempotencyGuard::new();
        assert_eq!(guard.admit("evt-1"), Admission::Proceed);
        assert_eq!(
            guard.admit("evt-1"),
            Admission::AlreadyProcessed { status: RecordStatus::InProgress }
        );

        guard.complete("evt-1", RecordStatus::Succeeded);
        assert_eq!(
            guard.admit("evt-1"),
            Admission::AlreadyProcessed { status: RecordStatus::Succeeded }
        );
        assert_eq!(guard.len(), 1);
        assert_eq!(guard.duplicates(), 2);
    }

    #[test]
    fn test_fingerprint_mismatch_is_conflict() {
        let guard = IdempotencyGuard::new();
        assert_eq!(guard.admit_with_fingerprint("evt-1", "a"), Admission::Proceed);
        assert!(matches!(
            guard.admit_with_fingerprint("evt-1", "a"),
            Admission::AlreadyProcessed { .. }
        ));
        assert_eq!(guard.admit_with_fingerprint("evt-1", "b"), Admission::Conflict);
        assert_eq!(guard.conflicts(), 1);
    }

    #[test]
    fn test_fingerprint_is_stable_hex() {
        let fp = fingerprint("payload");
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint("payload"));
        assert_ne!(fp, fingerprint("payload2"));
    }

    #[test]
    fn test_failed_event_is_not_readmitted() {
        let guard = IdempotencyGuard::new();
        guard.admit("evt-9");
        guard.complete("evt-9", RecordStatus::from(EventStatus::DeadLettered));
        assert_eq!(guard.status("evt-9"), Some(RecordStatus::Failed));
        assert!(matches!(guard.admit("evt-9"), Admission::AlreadyProcessed { .. }));
    }
}
