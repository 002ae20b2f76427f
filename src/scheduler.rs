//! Notification scheduling and delivery.
//!
//! Notices are durable rows in the WAL, not in-process timers: a sweep
//! pass asks the ledger which notices are due and pushes them through a
//! caller-supplied [`Notifier`]. A crash between a booking commit and its
//! notice enqueue is repaired by [`Engine::reconcile_reminders`].

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::warn;
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability;

/// A delivery attempt failed; the sweep will retry with backoff.
#[derive(Debug)]
pub struct DeliveryError(pub String);

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "delivery failed: {}", self.0)
    }
}

impl std::error::Error for DeliveryError {}

/// Outbound transport for notices. Implementations deliver over email,
/// push, or whatever channel the deployment wires in; the engine only
/// cares whether the attempt succeeded.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(
        &self,
        notice: &NotificationEvent,
        payload: &serde_json::Value,
    ) -> Result<(), DeliveryError>;
}

/// In-memory index of notification rows, rebuilt from the WAL on startup.
pub(crate) struct NotificationLedger {
    notices: DashMap<Ulid, NotificationEvent>,
    by_booking: DashMap<Ulid, Vec<Ulid>>,
}

impl NotificationLedger {
    pub(crate) fn new() -> Self {
        Self { notices: DashMap::new(), by_booking: DashMap::new() }
    }

    pub(crate) fn insert(&self, notice: NotificationEvent) {
        if let Some(booking_id) = notice.booking_id {
            self.by_booking.entry(booking_id).or_default().push(notice.id);
        }
        self.notices.insert(notice.id, notice);
    }

    pub(crate) fn get(&self, id: &Ulid) -> Option<NotificationEvent> {
        self.notices.get(id).map(|e| e.value().clone())
    }

    /// Does this booking already have a pending or sent notice of `kind`?
    pub(crate) fn has_kind(&self, booking_id: &Ulid, kind: NoticeKind) -> bool {
        let Some(ids) = self.by_booking.get(booking_id) else {
            return false;
        };
        ids.iter().any(|id| {
            self.notices
                .get(id)
                .is_some_and(|n| n.kind == kind && n.status != DeliveryStatus::Failed)
        })
    }

    /// The booking's undelivered notice of `kind`, if one exists.
    pub(crate) fn pending_of_kind(&self, booking_id: &Ulid, kind: NoticeKind) -> Option<Ulid> {
        let ids = self.by_booking.get(booking_id)?;
        ids.iter()
            .find(|id| {
                self.notices
                    .get(id)
                    .is_some_and(|n| n.kind == kind && n.status == DeliveryStatus::Pending)
            })
            .copied()
    }

    /// Pending notices whose fire (or retry) time has arrived.
    pub(crate) fn due(&self, now: Ms) -> Vec<NotificationEvent> {
        let mut out: Vec<NotificationEvent> = self
            .notices
            .iter()
            .filter(|e| {
                let n = e.value();
                n.status == DeliveryStatus::Pending && n.next_attempt_at.max(n.fire_at) <= now
            })
            .map(|e| e.value().clone())
            .collect();
        out.sort_by_key(|n| n.fire_at);
        out
    }

    pub(crate) fn mark_sent(&self, id: &Ulid, _at: Ms) {
        if let Some(mut e) = self.notices.get_mut(id) {
            e.status = DeliveryStatus::Sent;
        }
    }

    pub(crate) fn mark_retry(&self, id: &Ulid, attempts: u32, next_attempt_at: Ms) {
        if let Some(mut e) = self.notices.get_mut(id) {
            e.attempts = attempts;
            e.next_attempt_at = next_attempt_at;
        }
    }

    pub(crate) fn mark_failed(&self, id: &Ulid) {
        if let Some(mut e) = self.notices.get_mut(id) {
            e.status = DeliveryStatus::Failed;
        }
    }

    /// Move a pending notice to a new fire time, restarting its attempts.
    pub(crate) fn mark_retargeted(&self, id: &Ulid, fire_at: Ms) {
        if let Some(mut e) = self.notices.get_mut(id) {
            e.fire_at = fire_at;
            e.next_attempt_at = fire_at;
            e.attempts = 0;
        }
    }

    /// A notice overtaken by events. Shares the `Failed` terminal status;
    /// the abandonment audit record is what distinguishes real failures.
    pub(crate) fn mark_obsolete(&self, id: &Ulid) {
        self.mark_failed(id);
    }

    pub(crate) fn all(&self) -> Vec<NotificationEvent> {
        self.notices.iter().map(|e| e.value().clone()).collect()
    }
}

/// Who hears about a change, by who made it.
pub fn change_recipients(booking: &Booking, actor_role: Role) -> Vec<Recipient> {
    match actor_role {
        Role::User => vec![Recipient::trainer(booking.trainer_id), Recipient::admins()],
        Role::Trainer => vec![Recipient::user(booking.user_id), Recipient::admins()],
        Role::Admin => vec![Recipient::user(booking.user_id)],
        Role::System => {
            vec![Recipient::user(booking.user_id), Recipient::trainer(booking.trainer_id)]
        }
    }
}

/// Who hears about a cancellation, by who made it.
pub fn cancel_recipients(booking: &Booking, actor_role: Role) -> Vec<Recipient> {
    match actor_role {
        Role::User => vec![Recipient::trainer(booking.trainer_id), Recipient::admins()],
        Role::Trainer => vec![Recipient::user(booking.user_id), Recipient::admins()],
        Role::Admin => {
            vec![Recipient::user(booking.user_id), Recipient::trainer(booking.trainer_id)]
        }
        Role::System => {
            vec![Recipient::user(booking.user_id), Recipient::trainer(booking.trainer_id)]
        }
    }
}

/// Exponential backoff after a failed attempt, capped at one hour.
pub fn backoff_delay(base_ms: Ms, attempts: u32) -> Ms {
    let shift = attempts.saturating_sub(1).min(16);
    (base_ms << shift).min(HOUR_MS)
}

fn notice_payload(notice: &NotificationEvent) -> serde_json::Value {
    serde_json::json!({
        "notice_id": notice.id.to_string(),
        "booking_id": notice.booking_id.map(|id| id.to_string()),
        "kind": notice.kind,
        "fire_at": notice.fire_at,
    })
}

impl Engine {
    /// Enqueue the 48h reminder for a confirmed booking. Skipped when the
    /// fire time is already past, and duplicate-suppressed per booking.
    pub(crate) async fn schedule_reminder(&self, booking: &Booking, now: Ms) {
        let fire_at = booking.span.start - self.config.reminder_lead_ms;
        if fire_at <= now {
            return;
        }
        if self.notices.has_kind(&booking.id, NoticeKind::Reminder48h) {
            return;
        }
        let notice = NotificationEvent {
            id: Ulid::new(),
            booking_id: Some(booking.id),
            recipient: Recipient::user(booking.user_id),
            kind: NoticeKind::Reminder48h,
            fire_at,
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_attempt_at: fire_at,
        };
        if let Err(err) = self.persist_unscoped(&Event::NoticeScheduled { notice }).await {
            warn!(booking = %booking.id, %err, "failed to enqueue reminder");
            return;
        }
        metrics::counter!(observability::NOTICES_SCHEDULED_TOTAL).increment(1);
    }

    /// Enqueue immediate change/cancel notices for a committed mutation.
    /// Best effort: the booking itself is already durable, so an enqueue
    /// failure is logged rather than propagated.
    pub(crate) async fn notify_booking_event(
        &self,
        booking: &Booking,
        kind: NoticeKind,
        actor: Actor,
        now: Ms,
    ) {
        let recipients = match kind {
            NoticeKind::Cancelled => cancel_recipients(booking, actor.role),
            _ => change_recipients(booking, actor.role),
        };
        for recipient in recipients {
            let notice = NotificationEvent {
                id: Ulid::new(),
                booking_id: Some(booking.id),
                recipient,
                kind,
                fire_at: now,
                status: DeliveryStatus::Pending,
                attempts: 0,
                next_attempt_at: now,
            };
            if let Err(err) = self.persist_unscoped(&Event::NoticeScheduled { notice }).await {
                warn!(booking = %booking.id, %err, "failed to enqueue notice");
                continue;
            }
            metrics::counter!(observability::NOTICES_SCHEDULED_TOTAL).increment(1);
        }
        match kind {
            // The session no longer happens; its reminder must not fire.
            NoticeKind::Cancelled => self.obsolete_reminder(booking, now).await,
            // The session moved; the reminder follows it.
            _ => self.retarget_reminder(booking, now).await,
        }
    }

    /// Point the booking's pending reminder at the current session start,
    /// scheduling, moving, or retiring it as the new time demands.
    async fn retarget_reminder(&self, booking: &Booking, now: Ms) {
        let fire_at = booking.span.start - self.config.reminder_lead_ms;
        match self.notices.pending_of_kind(&booking.id, NoticeKind::Reminder48h) {
            Some(id) if fire_at > now => {
                if let Err(err) =
                    self.persist_unscoped(&Event::NoticeRetargeted { id, fire_at }).await
                {
                    warn!(notice = %id, %err, "failed to retarget reminder");
                }
            }
            // Moved inside the reminder window; the notice is moot.
            Some(id) => {
                if let Err(err) =
                    self.persist_unscoped(&Event::NoticeObsolete { id, at: now }).await
                {
                    warn!(notice = %id, %err, "failed to retire reminder");
                }
            }
            None => self.schedule_reminder(booking, now).await,
        }
    }

    /// Retire the booking's pending reminder, if any.
    async fn obsolete_reminder(&self, booking: &Booking, now: Ms) {
        if let Some(id) = self.notices.pending_of_kind(&booking.id, NoticeKind::Reminder48h) {
            if let Err(err) = self.persist_unscoped(&Event::NoticeObsolete { id, at: now }).await {
                warn!(notice = %id, %err, "failed to retire reminder");
            }
        }
    }

    /// One post-session follow-up per completed booking. A reminder still
    /// pending at completion (dispatch lagged past the session) is retired.
    pub(crate) async fn schedule_post_session(&self, booking: &Booking, now: Ms) {
        self.obsolete_reminder(booking, now).await;
        if self.notices.has_kind(&booking.id, NoticeKind::PostSession) {
            return;
        }
        let notice = NotificationEvent {
            id: Ulid::new(),
            booking_id: Some(booking.id),
            recipient: Recipient::user(booking.user_id),
            kind: NoticeKind::PostSession,
            fire_at: now,
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
        };
        if let Err(err) = self.persist_unscoped(&Event::NoticeScheduled { notice }).await {
            warn!(booking = %booking.id, %err, "failed to enqueue post-session notice");
            return;
        }
        metrics::counter!(observability::NOTICES_SCHEDULED_TOTAL).increment(1);
    }

    /// Direct or broadcast message outside any booking's lifecycle, e.g.
    /// a center-wide announcement. Admin and system actors only.
    pub async fn schedule_message(
        &self,
        recipient: Recipient,
        fire_at: Ms,
        actor: Actor,
    ) -> Result<NotificationEvent, EngineError> {
        if !matches!(actor.role, Role::Admin | Role::System) {
            return Err(EngineError::Authorization("only admins may send direct messages"));
        }
        let notice = NotificationEvent {
            id: Ulid::new(),
            booking_id: None,
            recipient,
            kind: NoticeKind::Message,
            fire_at,
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_attempt_at: fire_at,
        };
        self.persist_unscoped(&Event::NoticeScheduled { notice: notice.clone() })
            .await?;
        metrics::counter!(observability::NOTICES_SCHEDULED_TOTAL).increment(1);
        Ok(notice)
    }

    /// Repair reminders lost to a crash between commit and enqueue: every
    /// confirmed booking whose reminder window is still open gets one.
    pub async fn reconcile_reminders(&self, now: Ms) -> Result<(), EngineError> {
        let handles: Vec<_> = self.schedules.iter().map(|e| e.value().clone()).collect();
        let mut missing = Vec::new();
        for handle in handles {
            let guard = handle.read().await;
            for b in &guard.bookings {
                if matches!(b.status, BookingStatus::Confirmed | BookingStatus::Modified)
                    && b.span.start - self.config.reminder_lead_ms > now
                    && !self.notices.has_kind(&b.id, NoticeKind::Reminder48h)
                {
                    missing.push(b.clone());
                }
            }
        }
        for booking in missing {
            self.schedule_reminder(&booking, now).await;
        }
        Ok(())
    }

    /// Deliver every due notice through `notifier`. Failures back off
    /// exponentially; a notice out of attempts is abandoned and audited.
    /// Returns the number delivered.
    pub async fn dispatch_due(
        &self,
        now: Ms,
        notifier: &dyn Notifier,
    ) -> Result<usize, EngineError> {
        let due = self.notices.due(now);
        let mut sent = 0;
        for notice in due {
            // A reminder outlives its booking only through a failed retire
            // write; never deliver it for a session that won't happen.
            if notice.kind == NoticeKind::Reminder48h
                && let Some(booking_id) = notice.booking_id {
                    let occupies = self
                        .get_booking(booking_id)
                        .await?
                        .is_some_and(|b| b.status.occupies_slot());
                    if !occupies {
                        self.persist_unscoped(&Event::NoticeObsolete { id: notice.id, at: now })
                            .await?;
                        continue;
                    }
                }
            let payload = notice_payload(&notice);
            match notifier.deliver(&notice, &payload).await {
                Ok(()) => {
                    self.persist_unscoped(&Event::NoticeSent { id: notice.id, at: now }).await?;
                    metrics::counter!(observability::NOTICES_SENT_TOTAL).increment(1);
                    sent += 1;
                }
                Err(err) => {
                    let attempts = notice.attempts + 1;
                    if attempts >= self.config.max_delivery_attempts {
                        warn!(notice = %notice.id, %err, attempts, "notice abandoned");
                        self.persist_unscoped(&Event::NoticeAbandoned { id: notice.id, at: now })
                            .await?;
                        metrics::counter!(observability::NOTICES_ABANDONED_TOTAL).increment(1);
                    } else {
                        let base = self.config.delivery_retry_base.as_millis() as Ms;
                        let delay = backoff_delay(base, attempts);
                        warn!(notice = %notice.id, %err, attempts, "delivery failed, will retry");
                        self.persist_unscoped(&Event::NoticeRetry {
                            id: notice.id,
                            attempts,
                            next_attempt_at: now + delay,
                        })
                        .await?;
                    }
                }
            }
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(user: Ulid, trainer: Ulid) -> Booking {
        let now = 1_000_000;
        Booking {
            id: Ulid::new(),
            user_id: user,
            trainer_id: trainer,
            center_id: Ulid::new(),
            span: Span { start: now + DAY_MS, end: now + DAY_MS + HOUR_MS },
            status: BookingStatus::Confirmed,
            version: 1,
            created_at: now,
            updated_at: now,
            updated_by: Actor { id: user, role: Role::User },
            message: None,
        }
    }

    #[test]
    fn user_change_notifies_trainer_and_admins() {
        let b = booking(Ulid::new(), Ulid::new());
        let rs = change_recipients(&b, Role::User);
        assert_eq!(rs.len(), 2);
        assert_eq!(rs[0], Recipient::trainer(b.trainer_id));
        assert_eq!(rs[1], Recipient::admins());
    }

    #[test]
    fn admin_change_notifies_user_only() {
        let b = booking(Ulid::new(), Ulid::new());
        let rs = change_recipients(&b, Role::Admin);
        assert_eq!(rs, vec![Recipient::user(b.user_id)]);
    }

    #[test]
    fn admin_cancel_notifies_both_parties() {
        let b = booking(Ulid::new(), Ulid::new());
        let rs = cancel_recipients(&b, Role::Admin);
        assert_eq!(rs.len(), 2);
        assert!(rs.contains(&Recipient::user(b.user_id)));
        assert!(rs.contains(&Recipient::trainer(b.trainer_id)));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = 30_000;
        assert_eq!(backoff_delay(base, 1), 30_000);
        assert_eq!(backoff_delay(base, 2), 60_000);
        assert_eq!(backoff_delay(base, 3), 120_000);
        assert_eq!(backoff_delay(base, 30), HOUR_MS);
    }

    #[test]
    fn ledger_dedupes_by_kind() {
        let ledger = NotificationLedger::new();
        let booking_id = Ulid::new();
        let notice = NotificationEvent {
            id: Ulid::new(),
            booking_id: Some(booking_id),
            recipient: Recipient::user(Ulid::new()),
            kind: NoticeKind::Reminder48h,
            fire_at: 5_000,
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_attempt_at: 5_000,
        };
        ledger.insert(notice.clone());
        assert!(ledger.has_kind(&booking_id, NoticeKind::Reminder48h));
        assert!(!ledger.has_kind(&booking_id, NoticeKind::PostSession));

        // A failed notice no longer counts; it may be re-scheduled.
        ledger.mark_failed(&notice.id);
        assert!(!ledger.has_kind(&booking_id, NoticeKind::Reminder48h));
    }

    #[test]
    fn retarget_moves_fire_time_and_resets_attempts() {
        let ledger = NotificationLedger::new();
        let booking_id = Ulid::new();
        let id = Ulid::new();
        ledger.insert(NotificationEvent {
            id,
            booking_id: Some(booking_id),
            recipient: Recipient::user(Ulid::new()),
            kind: NoticeKind::Reminder48h,
            fire_at: 10_000,
            status: DeliveryStatus::Pending,
            attempts: 2,
            next_attempt_at: 40_000,
        });
        assert_eq!(ledger.pending_of_kind(&booking_id, NoticeKind::Reminder48h), Some(id));

        ledger.mark_retargeted(&id, 80_000);
        let n = ledger.get(&id).unwrap();
        assert_eq!(n.fire_at, 80_000);
        assert_eq!(n.next_attempt_at, 80_000);
        assert_eq!(n.attempts, 0);
        assert!(ledger.due(40_000).is_empty());
        assert_eq!(ledger.due(80_000).len(), 1);

        // A retired notice is no longer pending and never due.
        ledger.mark_obsolete(&id);
        assert_eq!(ledger.pending_of_kind(&booking_id, NoticeKind::Reminder48h), None);
        assert!(ledger.due(80_000).is_empty());
    }

    #[test]
    fn due_respects_fire_and_retry_times() {
        let ledger = NotificationLedger::new();
        let id = Ulid::new();
        ledger.insert(NotificationEvent {
            id,
            booking_id: None,
            recipient: Recipient::admins(),
            kind: NoticeKind::Message,
            fire_at: 10_000,
            status: DeliveryStatus::Pending,
            attempts: 0,
            next_attempt_at: 10_000,
        });
        assert!(ledger.due(9_999).is_empty());
        assert_eq!(ledger.due(10_000).len(), 1);

        ledger.mark_retry(&id, 1, 50_000);
        assert!(ledger.due(10_000).is_empty());
        assert_eq!(ledger.due(50_000).len(), 1);

        ledger.mark_sent(&id, 50_000);
        assert!(ledger.due(100_000).is_empty());
    }
}
