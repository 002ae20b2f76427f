mod arbiter;
pub mod availability;
mod error;
mod queries;

pub use arbiter::now_ms;
pub use availability::{Occurrences, merge_overlapping, occurrences};
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::audit::AuditLog;
use crate::config::EngineConfig;
use crate::model::*;
use crate::scheduler::NotificationLedger;
use crate::wal::Wal;

pub type SharedTrainerSchedule = Arc<RwLock<TrainerSchedule>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit:
/// block on the first append, drain every immediately available append into
/// the same batch, then a single `flush_sync` covers all of them.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let mut batch = Vec::new();
        let mut deferred = None;

        match cmd {
            WalCommand::Append { event, response } => {
                batch.push((event, response));
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => batch.push((event, response)),
                        other => {
                            // Flush the batch first, then handle this below.
                            deferred = Some(other);
                            break;
                        }
                    }
                }
            }
            other => deferred = Some(other),
        }

        if !batch.is_empty() {
            metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                .record(batch.len() as f64);
            let flush_start = std::time::Instant::now();
            let result = flush_batch(&mut wal, &batch);
            metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                .record(flush_start.elapsed().as_secs_f64());
            for (_, tx) in batch {
                let r = match &result {
                    Ok(()) => Ok(()),
                    Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
                };
                let _ = tx.send(r);
            }
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

// ── Engine ───────────────────────────────────────────────

/// The scheduling core. One `Engine` owns the availability store, the
/// booking ledger, the notification ledger, and the audit log, all
/// rebuilt from the WAL on startup.
pub struct Engine {
    /// Per-trainer schedule state. The write lock on one entry is THE
    /// double-booking guard: every mutation of a trainer's schedule runs
    /// its whole read-validate-write sequence under it.
    pub(crate) schedules: DashMap<Ulid, SharedTrainerSchedule>,
    /// Reverse lookup: booking id → trainer id.
    pub(crate) booking_index: DashMap<Ulid, Ulid>,
    /// Reverse lookup: window id → trainer id.
    pub(crate) window_index: DashMap<Ulid, Ulid>,
    pub(crate) notices: NotificationLedger,
    pub audit: AuditLog,
    pub(crate) wal_tx: mpsc::Sender<WalCommand>,
    pub config: EngineConfig,
}

impl Engine {
    pub fn new(wal_path: PathBuf, config: EngineConfig) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            schedules: DashMap::new(),
            booking_index: DashMap::new(),
            window_index: DashMap::new(),
            notices: NotificationLedger::new(),
            audit: AuditLog::new(),
            wal_tx,
            config,
        };

        // Replay — we're the sole owner of these Arcs, so try_write always
        // succeeds instantly. Never blocking_write here: replay may run
        // inside an async context.
        for event in &events {
            match event_trainer_id(event) {
                Some(trainer_id) => {
                    let rs = engine.schedule_handle(trainer_id);
                    let mut guard = rs.try_write().expect("replay: uncontended write");
                    engine.apply_event(Some(&mut guard), event);
                }
                None => engine.apply_event(None, event),
            }
        }

        Ok(engine)
    }

    /// Get or lazily create the schedule for a trainer. Trainers are
    /// external reference data; their schedule materializes on first use.
    pub(crate) fn schedule_handle(&self, trainer_id: Ulid) -> SharedTrainerSchedule {
        self.schedules
            .entry(trainer_id)
            .or_insert_with(|| Arc::new(RwLock::new(TrainerSchedule::new(trainer_id))))
            .value()
            .clone()
    }

    /// Acquire the exclusive per-trainer scheduling lock, creating the
    /// schedule if needed. Bounded wait; `LockTimeout` is retryable.
    pub(crate) async fn lock_trainer(
        &self,
        trainer_id: Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<TrainerSchedule>, EngineError> {
        let rs = self.schedule_handle(trainer_id);
        tokio::time::timeout(self.config.lock_timeout, rs.write_owned())
            .await
            .map_err(|_| EngineError::LockTimeout(trainer_id))
    }

    /// Shared (read) access with the same bounded wait.
    pub(crate) async fn read_trainer(
        &self,
        trainer_id: Ulid,
    ) -> Result<Option<tokio::sync::OwnedRwLockReadGuard<TrainerSchedule>>, EngineError> {
        let Some(entry) = self.schedules.get(&trainer_id) else {
            return Ok(None);
        };
        let rs = entry.value().clone();
        drop(entry);
        tokio::time::timeout(self.config.lock_timeout, rs.read_owned())
            .await
            .map(Some)
            .map_err(|_| EngineError::LockTimeout(trainer_id))
    }

    /// Write an event to the WAL via the background group-commit writer.
    pub(crate) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// WAL-append + apply in one call: the durable commit point of every
    /// schedule-affecting transaction. Caller holds the trainer lock.
    pub(crate) async fn persist_and_apply(
        &self,
        rs: &mut TrainerSchedule,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_event(Some(rs), event);
        Ok(())
    }

    /// Commit an event that touches no trainer schedule (notice lifecycle).
    pub(crate) async fn persist_unscoped(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_event(None, event);
        Ok(())
    }

    /// Apply an event to in-memory state. Booking/window events also derive
    /// the audit entry — one WAL record commits both, which is what makes
    /// the ledger+audit write atomic.
    fn apply_event(&self, rs: Option<&mut TrainerSchedule>, event: &Event) {
        match event {
            Event::WindowDefined { window, actor, at } => {
                let rs = rs.expect("window event routed without schedule");
                rs.insert_window(window.clone());
                self.window_index.insert(window.id, window.trainer_id);
                self.audit.record(AuditRecord {
                    id: Ulid::new(),
                    booking_id: None,
                    user_id: None,
                    trainer_id: Some(window.trainer_id),
                    actor: *actor,
                    action: AuditAction::WindowDefined,
                    before: None,
                    after: None,
                    at: *at,
                });
            }
            Event::WindowRevoked { id, trainer_id, actor, at } => {
                let rs = rs.expect("window event routed without schedule");
                if let Some(w) = rs.window_mut(id) {
                    w.active = false;
                }
                self.audit.record(AuditRecord {
                    id: Ulid::new(),
                    booking_id: None,
                    user_id: None,
                    trainer_id: Some(*trainer_id),
                    actor: *actor,
                    action: AuditAction::WindowRevoked,
                    before: None,
                    after: None,
                    at: *at,
                });
            }
            Event::BookingCreated { booking, actor } => {
                let rs = rs.expect("booking event routed without schedule");
                rs.insert_booking(booking.clone());
                self.booking_index.insert(booking.id, booking.trainer_id);
                self.audit.record(AuditRecord {
                    id: Ulid::new(),
                    booking_id: Some(booking.id),
                    user_id: Some(booking.user_id),
                    trainer_id: Some(booking.trainer_id),
                    actor: *actor,
                    action: AuditAction::Created,
                    before: None,
                    after: Some(booking.snapshot()),
                    at: booking.created_at,
                });
            }
            Event::BookingModified { id, span, message, actor, at, .. } => {
                let rs = rs.expect("booking event routed without schedule");
                let Some(before) = rs.booking(id).map(|b| b.snapshot()) else {
                    return;
                };
                let (user_id, trainer_id);
                let after = {
                    let b = rs
                        .reslot_booking(id, *span)
                        .expect("booking present above");
                    b.status = BookingStatus::Modified;
                    b.version += 1;
                    if message.is_some() {
                        b.message = message.clone();
                    }
                    b.updated_at = *at;
                    b.updated_by = *actor;
                    user_id = b.user_id;
                    trainer_id = b.trainer_id;
                    b.snapshot()
                };
                self.audit.record(AuditRecord {
                    id: Ulid::new(),
                    booking_id: Some(*id),
                    user_id: Some(user_id),
                    trainer_id: Some(trainer_id),
                    actor: *actor,
                    action: AuditAction::Modified,
                    before: Some(before),
                    after: Some(after),
                    at: *at,
                });
            }
            Event::BookingCancelled { id, message, actor, at, .. } => {
                self.transition_booking(
                    rs,
                    id,
                    BookingStatus::Cancelled,
                    message.clone(),
                    *actor,
                    *at,
                    AuditAction::Cancelled,
                );
            }
            Event::BookingConfirmed { id, at, .. } => {
                self.transition_booking(
                    rs,
                    id,
                    BookingStatus::Confirmed,
                    None,
                    Actor::system(),
                    *at,
                    AuditAction::Confirmed,
                );
            }
            Event::BookingCompleted { id, at, .. } => {
                self.transition_booking(
                    rs,
                    id,
                    BookingStatus::Completed,
                    None,
                    Actor::system(),
                    *at,
                    AuditAction::Completed,
                );
            }
            Event::NoticeScheduled { notice } => {
                self.notices.insert(notice.clone());
            }
            Event::NoticeSent { id, at } => {
                self.notices.mark_sent(id, *at);
            }
            Event::NoticeRetry { id, attempts, next_attempt_at } => {
                self.notices.mark_retry(id, *attempts, *next_attempt_at);
            }
            Event::NoticeRetargeted { id, fire_at } => {
                self.notices.mark_retargeted(id, *fire_at);
            }
            Event::NoticeObsolete { id, .. } => {
                self.notices.mark_obsolete(id);
            }
            Event::NoticeAbandoned { id, at } => {
                let booking_id = self.notices.get(id).and_then(|n| n.booking_id);
                self.notices.mark_failed(id);
                self.audit.record(AuditRecord {
                    id: Ulid::new(),
                    booking_id,
                    user_id: None,
                    trainer_id: None,
                    actor: Actor::system(),
                    action: AuditAction::NoticeAbandoned,
                    before: None,
                    after: None,
                    at: *at,
                });
            }
            // Compaction snapshots: restore state verbatim, no fresh audit.
            Event::SnapshotWindow { window } => {
                let rs = rs.expect("window event routed without schedule");
                self.window_index.insert(window.id, window.trainer_id);
                rs.insert_window(window.clone());
            }
            Event::SnapshotBooking { booking } => {
                let rs = rs.expect("booking event routed without schedule");
                self.booking_index.insert(booking.id, booking.trainer_id);
                rs.insert_booking(booking.clone());
            }
            Event::SnapshotAudit { record } => {
                self.audit.record(record.clone());
            }
        }
    }

    /// Shared status-transition apply for cancel/confirm/complete.
    #[allow(clippy::too_many_arguments)]
    fn transition_booking(
        &self,
        rs: Option<&mut TrainerSchedule>,
        id: &Ulid,
        status: BookingStatus,
        message: Option<String>,
        actor: Actor,
        at: Ms,
        action: AuditAction,
    ) {
        let rs = rs.expect("booking event routed without schedule");
        let Some(b) = rs.booking_mut(id) else { return };
        let before = b.snapshot();
        b.status = status;
        b.version += 1;
        if message.is_some() {
            b.message = message;
        }
        b.updated_at = at;
        b.updated_by = actor;
        let after = b.snapshot();
        let (user_id, trainer_id) = (b.user_id, b.trainer_id);
        self.audit.record(AuditRecord {
            id: Ulid::new(),
            booking_id: Some(*id),
            user_id: Some(user_id),
            trainer_id: Some(trainer_id),
            actor,
            action,
            before: Some(before),
            after: Some(after),
            at,
        });
    }

    // ── WAL compaction ───────────────────────────────────

    /// Rewrite the WAL with the minimal snapshot of current state. Audit
    /// history is preserved verbatim via `SnapshotAudit` so compaction
    /// never erases the change trail.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.schedules.iter() {
            let rs = entry.value().clone();
            let guard = rs.read().await;
            for window in &guard.windows {
                events.push(Event::SnapshotWindow { window: window.clone() });
            }
            for booking in &guard.bookings {
                events.push(Event::SnapshotBooking { booking: booking.clone() });
            }
        }
        for notice in self.notices.all() {
            events.push(Event::NoticeScheduled { notice });
        }
        for record in self.audit.all() {
            events.push(Event::SnapshotAudit { record });
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Which trainer schedule an event must be applied under, if any.
fn event_trainer_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::WindowDefined { window, .. } => Some(window.trainer_id),
        Event::SnapshotWindow { window } => Some(window.trainer_id),
        Event::BookingCreated { booking, .. } => Some(booking.trainer_id),
        Event::SnapshotBooking { booking } => Some(booking.trainer_id),
        Event::WindowRevoked { trainer_id, .. }
        | Event::BookingModified { trainer_id, .. }
        | Event::BookingCancelled { trainer_id, .. }
        | Event::BookingConfirmed { trainer_id, .. }
        | Event::BookingCompleted { trainer_id, .. } => Some(*trainer_id),
        Event::NoticeScheduled { .. }
        | Event::NoticeSent { .. }
        | Event::NoticeRetry { .. }
        | Event::NoticeAbandoned { .. }
        | Event::NoticeRetargeted { .. }
        | Event::NoticeObsolete { .. }
        | Event::SnapshotAudit { .. } => None,
    }
}
