use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::span_within_availability;
use super::{Engine, EngineError, Event};

pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as Ms
}

/// Validate a requested session range against `now` and the minimum lead.
pub(super) fn validate_session_span(
    span: &Span,
    now: Ms,
    min_lead_ms: Ms,
) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidRange("session start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidRange("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SESSION_DURATION_MS {
        return Err(EngineError::InvalidRange("session too long"));
    }
    if span.start < now + min_lead_ms {
        return Err(EngineError::InvalidRange(
            "session must start at least the minimum lead time in the future",
        ));
    }
    Ok(())
}

/// The 24h business rule: is the user-facing change window already closed?
/// Trainers and admins are exempt; their callers skip this check.
pub(super) fn change_window_closed(start: Ms, now: Ms, cancel_window_ms: Ms) -> bool {
    now >= start - cancel_window_ms
}

/// Who may touch an existing booking: its user, its trainer, or an admin.
pub(super) fn authorize_booking_change(
    booking: &Booking,
    actor: &Actor,
) -> Result<(), EngineError> {
    match actor.role {
        Role::Admin | Role::System => Ok(()),
        Role::Trainer if actor.id == booking.trainer_id => Ok(()),
        Role::User if actor.id == booking.user_id => Ok(()),
        Role::Trainer => Err(EngineError::Authorization(
            "trainers may only change bookings on their own schedule",
        )),
        Role::User => Err(EngineError::Authorization(
            "users may only change their own bookings",
        )),
    }
}

fn validate_message(message: &Option<String>) -> Result<(), EngineError> {
    if let Some(m) = message
        && m.len() > MAX_MESSAGE_LEN {
            return Err(EngineError::LimitExceeded("message too long"));
        }
    Ok(())
}

/// First non-terminal booking overlapping `span`, excluding `exclude`.
fn find_double_booking(rs: &TrainerSchedule, span: Span, exclude: Option<Ulid>) -> Option<Ulid> {
    rs.occupying_overlapping(span)
        .find(|b| exclude != Some(b.id))
        .map(|b| b.id)
}

impl Engine {
    /// Create a booking for a user on a trainer's schedule.
    ///
    /// The whole read-validate-write sequence runs under the exclusive
    /// per-trainer lock: of two concurrent requests for overlapping slots,
    /// whichever acquires the lock first wins; the loser observes
    /// `DoubleBooking` and must retry against refreshed availability.
    pub async fn create_booking(
        &self,
        user_id: Ulid,
        trainer_id: Ulid,
        center_id: Ulid,
        span: Span,
        message: Option<String>,
        actor: Actor,
    ) -> Result<Booking, EngineError> {
        let now = now_ms();
        validate_session_span(&span, now, self.config.min_lead_ms)?;
        validate_message(&message)?;
        match actor.role {
            Role::User if actor.id != user_id => {
                return Err(EngineError::Authorization("users may only book for themselves"));
            }
            Role::Trainer if actor.id != trainer_id => {
                return Err(EngineError::Authorization(
                    "trainers may only book onto their own schedule",
                ));
            }
            Role::System => {
                return Err(EngineError::Authorization("system actor cannot create bookings"));
            }
            _ => {}
        }

        let mut guard = self.lock_trainer(trainer_id).await?;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_TRAINER {
            return Err(EngineError::LimitExceeded("too many bookings for trainer"));
        }
        if !span_within_availability(&guard, center_id, &span) {
            return Err(EngineError::AvailabilityNotFound(trainer_id));
        }
        if let Some(existing) = find_double_booking(&guard, span, None) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::DoubleBooking(existing));
        }

        let status = if self.config.require_payment_confirmation {
            BookingStatus::Pending
        } else {
            BookingStatus::Confirmed
        };
        let booking = Booking {
            id: Ulid::new(),
            user_id,
            trainer_id,
            center_id,
            span,
            status,
            version: 1,
            created_at: now,
            updated_at: now,
            updated_by: actor,
            message,
        };
        let event = Event::BookingCreated { booking: booking.clone(), actor };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        metrics::counter!(observability::BOOKINGS_CREATED_TOTAL).increment(1);
        debug!(booking = %booking.id, trainer = %trainer_id, "booking created");

        // Notification enqueue is outside the lock, after the commit; the
        // sweep reconciles a crash landing between the two.
        if booking.status == BookingStatus::Confirmed {
            self.schedule_reminder(&booking, now).await;
        }
        Ok(booking)
    }

    /// Move a booking to a new time range.
    pub async fn modify_booking(
        &self,
        booking_id: Ulid,
        new_span: Span,
        expected_version: u64,
        message: Option<String>,
        actor: Actor,
    ) -> Result<Booking, EngineError> {
        let now = now_ms();
        validate_session_span(&new_span, now, self.config.min_lead_ms)?;
        validate_message(&message)?;

        let trainer_id = self
            .booking_index
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut guard = self.lock_trainer(trainer_id).await?;
        let booking = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        authorize_booking_change(&booking, &actor)?;
        if booking.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "booking is {:?} and cannot change",
                booking.status
            )));
        }
        if booking.version != expected_version {
            return Err(EngineError::StaleVersion { actual: booking.version });
        }
        if actor.role == Role::User
            && change_window_closed(booking.span.start, now, self.config.cancel_window_ms)
        {
            return Err(EngineError::WindowClosed { starts_at: booking.span.start });
        }

        // Same validation as creation, excluding the booking's own slot.
        if !span_within_availability(&guard, booking.center_id, &new_span) {
            return Err(EngineError::AvailabilityNotFound(trainer_id));
        }
        if let Some(existing) = find_double_booking(&guard, new_span, Some(booking_id)) {
            metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            return Err(EngineError::DoubleBooking(existing));
        }

        let event = Event::BookingModified {
            id: booking_id,
            trainer_id,
            span: new_span,
            message,
            actor,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let updated = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        drop(guard);

        metrics::counter!(observability::BOOKINGS_MODIFIED_TOTAL).increment(1);
        self.notify_booking_event(&updated, NoticeKind::Changed, actor, now).await;
        Ok(updated)
    }

    /// Cancel a booking. Same authorization and 24h rules as modification.
    pub async fn cancel_booking(
        &self,
        booking_id: Ulid,
        expected_version: u64,
        message: Option<String>,
        actor: Actor,
    ) -> Result<Booking, EngineError> {
        let now = now_ms();
        validate_message(&message)?;

        let trainer_id = self
            .booking_index
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut guard = self.lock_trainer(trainer_id).await?;
        let booking = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        authorize_booking_change(&booking, &actor)?;
        if booking.status.is_terminal() {
            return Err(EngineError::Conflict(format!(
                "booking is {:?} and cannot change",
                booking.status
            )));
        }
        if booking.version != expected_version {
            return Err(EngineError::StaleVersion { actual: booking.version });
        }
        if actor.role == Role::User
            && change_window_closed(booking.span.start, now, self.config.cancel_window_ms)
        {
            return Err(EngineError::WindowClosed { starts_at: booking.span.start });
        }

        let event = Event::BookingCancelled {
            id: booking_id,
            trainer_id,
            message,
            actor,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        let cancelled = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        drop(guard);

        metrics::counter!(observability::BOOKINGS_CANCELLED_TOTAL).increment(1);
        self.notify_booking_event(&cancelled, NoticeKind::Cancelled, actor, now).await;
        Ok(cancelled)
    }

    /// Payment collaborator entry point: a `Pending` (or re-modified)
    /// booking becomes `Confirmed`. No actor check — the caller is trusted
    /// infrastructure, not an end user.
    pub async fn confirm_payment(&self, booking_id: Ulid) -> Result<Booking, EngineError> {
        let now = now_ms();
        let trainer_id = self
            .booking_index
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(booking_id))?;
        let mut guard = self.lock_trainer(trainer_id).await?;
        let booking = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;

        if !matches!(booking.status, BookingStatus::Pending | BookingStatus::Modified) {
            return Err(EngineError::Conflict(format!(
                "booking is {:?}, not awaiting confirmation",
                booking.status
            )));
        }

        let event = Event::BookingConfirmed { id: booking_id, trainer_id, at: now };
        self.persist_and_apply(&mut guard, &event).await?;
        let confirmed = guard
            .booking(&booking_id)
            .cloned()
            .ok_or(EngineError::NotFound(booking_id))?;
        drop(guard);

        self.schedule_reminder(&confirmed, now).await;
        Ok(confirmed)
    }

    /// System-driven completion: every `Confirmed`/`Modified` booking whose
    /// session has ended transitions to `Completed` and gets exactly one
    /// post-session notice. Idempotent — completed bookings are skipped, and
    /// the notice is duplicate-suppressed, so overlapping sweep runs are
    /// harmless. Returns the completed bookings.
    pub async fn complete_finished(&self, now: Ms) -> Result<Vec<Booking>, EngineError> {
        // Collect candidates without blocking writers; contended schedules
        // are picked up by the next sweep.
        let mut candidates: Vec<(Ulid, Ulid)> = Vec::new();
        for entry in self.schedules.iter() {
            if let Ok(guard) = entry.value().try_read() {
                for b in &guard.bookings {
                    if b.span.end <= now
                        && matches!(b.status, BookingStatus::Confirmed | BookingStatus::Modified)
                    {
                        candidates.push((b.id, guard.trainer_id));
                    }
                }
            }
        }

        let mut completed = Vec::new();
        for (booking_id, trainer_id) in candidates {
            let mut guard = self.lock_trainer(trainer_id).await?;
            // Re-check under the lock; another run may have won.
            let still_due = guard.booking(&booking_id).is_some_and(|b| {
                b.span.end <= now
                    && matches!(b.status, BookingStatus::Confirmed | BookingStatus::Modified)
            });
            if !still_due {
                continue;
            }
            let event = Event::BookingCompleted { id: booking_id, trainer_id, at: now };
            self.persist_and_apply(&mut guard, &event).await?;
            if let Some(b) = guard.booking(&booking_id) {
                completed.push(b.clone());
            }
            drop(guard);
            metrics::counter!(observability::BOOKINGS_COMPLETED_TOTAL).increment(1);
        }

        for booking in &completed {
            self.schedule_post_session(booking, now).await;
        }
        Ok(completed)
    }
}
