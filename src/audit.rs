use std::sync::RwLock;

use ulid::Ulid;

use crate::model::{AuditRecord, Ms};

/// Append-only sink for state transitions. Records are derived from WAL
/// events during apply, so durability rides on the booking transaction —
/// this structure never touches the disk itself.
pub struct AuditLog {
    records: RwLock<Vec<AuditRecord>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self { records: RwLock::new(Vec::new()) }
    }

    /// Append a record. Never fails; storage failures surface earlier,
    /// from the WAL append that carries this record's source event.
    pub fn record(&self, record: AuditRecord) {
        self.records
            .write()
            .expect("audit log lock poisoned")
            .push(record);
    }

    pub fn len(&self) -> usize {
        self.records.read().expect("audit log lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn filter(&self, pred: impl Fn(&AuditRecord) -> bool) -> Vec<AuditRecord> {
        self.records
            .read()
            .expect("audit log lock poisoned")
            .iter()
            .filter(|r| pred(r))
            .cloned()
            .collect()
    }

    pub fn query_by_booking(&self, booking_id: Ulid) -> Vec<AuditRecord> {
        self.filter(|r| r.booking_id == Some(booking_id))
    }

    pub fn query_by_user(&self, user_id: Ulid) -> Vec<AuditRecord> {
        self.filter(|r| r.user_id == Some(user_id))
    }

    pub fn query_by_trainer(&self, trainer_id: Ulid) -> Vec<AuditRecord> {
        self.filter(|r| r.trainer_id == Some(trainer_id))
    }

    /// Records whose timestamp lies in `[from, to)`.
    pub fn query_by_date_range(&self, from: Ms, to: Ms) -> Vec<AuditRecord> {
        self.filter(|r| r.at >= from && r.at < to)
    }

    /// Everything, in append order. Used by WAL compaction.
    pub fn all(&self) -> Vec<AuditRecord> {
        self.records.read().expect("audit log lock poisoned").clone()
    }
}
