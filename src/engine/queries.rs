use ulid::Ulid;

use crate::model::{AuditRecord, Booking, BookingFilter, Ms};

use super::{Engine, EngineError};

impl Engine {
    /// Fetch a single booking by id. `Ok(None)` means the booking does not
    /// exist; a contended schedule surfaces as `LockTimeout`, never as
    /// absence.
    pub async fn get_booking(&self, booking_id: Ulid) -> Result<Option<Booking>, EngineError> {
        let Some(trainer_id) = self.booking_index.get(&booking_id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(guard) = self.read_trainer(trainer_id).await? else {
            return Ok(None);
        };
        Ok(guard.booking(&booking_id).cloned())
    }

    /// All bookings matching `filter`, ordered by start time.
    ///
    /// When a trainer is named the scan touches only that schedule;
    /// otherwise every schedule is read in turn under its shared lock.
    pub async fn query_bookings(
        &self,
        filter: &BookingFilter,
    ) -> Result<Vec<Booking>, EngineError> {
        let mut out = Vec::new();
        if let Some(trainer_id) = filter.trainer_id {
            if let Some(guard) = self.read_trainer(trainer_id).await? {
                out.extend(guard.bookings.iter().filter(|b| filter.matches(b)).cloned());
            }
            return Ok(out);
        }
        let handles: Vec<_> = self.schedules.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            let guard = handle.read().await;
            out.extend(guard.bookings.iter().filter(|b| filter.matches(b)).cloned());
        }
        out.sort_by_key(|b| b.span.start);
        Ok(out)
    }

    pub fn booking_history(&self, booking_id: Ulid) -> Vec<AuditRecord> {
        self.audit.query_by_booking(booking_id)
    }

    pub fn user_history(&self, user_id: Ulid) -> Vec<AuditRecord> {
        self.audit.query_by_user(user_id)
    }

    pub fn trainer_history(&self, trainer_id: Ulid) -> Vec<AuditRecord> {
        self.audit.query_by_trainer(trainer_id)
    }

    pub fn history_in_range(&self, from: Ms, to: Ms) -> Vec<AuditRecord> {
        self.audit.query_by_date_range(from, to)
    }
}
