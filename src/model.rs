use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;
pub const DAY_MS: Ms = 86_400_000;
pub const WEEK_MS: Ms = 7 * DAY_MS;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Intersection with `other`, if non-empty.
    pub fn clamp_to(&self, other: &Span) -> Option<Span> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then(|| Span::new(start, end))
    }
}

// ── Actors ───────────────────────────────────────────────────────

/// Who is acting. Identity verification happens upstream; the engine
/// trusts the `(id, role)` pair completely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Trainer,
    Admin,
    /// Background sweep. Never supplied by callers.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Ulid,
    pub role: Role,
}

impl Actor {
    pub fn new(id: Ulid, role: Role) -> Self {
        Self { id, role }
    }

    pub fn system() -> Self {
        Self { id: Ulid::nil(), role: Role::System }
    }
}

// ── Availability ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recurrence {
    None,
    Daily,
    Weekly,
    Monthly,
}

/// A trainer's open time slot at a center. `first` is the base occurrence;
/// the recurrence rule repeats it until `until` (exclusive), or forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Ulid,
    pub trainer_id: Ulid,
    pub center_id: Ulid,
    pub first: Span,
    pub recurrence: Recurrence,
    pub until: Option<Ms>,
    /// Superseded windows stay in the schedule for history but open nothing.
    pub active: bool,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Modified,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }

    /// Does this booking occupy its slot for double-booking purposes?
    pub fn occupies_slot(&self) -> bool {
        matches!(
            self,
            BookingStatus::Pending | BookingStatus::Confirmed | BookingStatus::Modified
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub user_id: Ulid,
    pub trainer_id: Ulid,
    pub center_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
    /// Optimistic concurrency counter. Starts at 1, bumped on every mutation.
    pub version: u64,
    pub created_at: Ms,
    pub updated_at: Ms,
    pub updated_by: Actor,
    /// Free-text note from the last create/modify/cancel.
    pub message: Option<String>,
}

impl Booking {
    pub fn snapshot(&self) -> BookingSnapshot {
        BookingSnapshot {
            span: self.span,
            status: self.status,
            version: self.version,
            message: self.message.clone(),
        }
    }
}

// ── Notifications ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoticeKind {
    Reminder48h,
    Changed,
    Cancelled,
    PostSession,
    Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// `id: None` is a role broadcast (e.g. "all admins"); resolving the
/// concrete recipients is the messaging collaborator's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub role: Role,
    pub id: Option<Ulid>,
}

impl Recipient {
    pub fn user(id: Ulid) -> Self {
        Self { role: Role::User, id: Some(id) }
    }

    pub fn trainer(id: Ulid) -> Self {
        Self { role: Role::Trainer, id: Some(id) }
    }

    pub fn admins() -> Self {
        Self { role: Role::Admin, id: None }
    }
}

/// Durable "fire later" record. Dispatch is driven by the periodic sweep,
/// never by in-memory timers, so scheduled notices survive restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub id: Ulid,
    pub booking_id: Option<Ulid>,
    pub recipient: Recipient,
    pub kind: NoticeKind,
    pub fire_at: Ms,
    pub status: DeliveryStatus,
    pub attempts: u32,
    /// Earliest time the next delivery attempt may run (backoff).
    pub next_attempt_at: Ms,
}

// ── Audit ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    Created,
    Modified,
    Cancelled,
    Confirmed,
    Completed,
    WindowDefined,
    WindowRevoked,
    NoticeAbandoned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingSnapshot {
    pub span: Span,
    pub status: BookingStatus,
    pub version: u64,
    pub message: Option<String>,
}

/// One state transition. Appended on every commit, never mutated.
/// `user_id`/`trainer_id` are denormalized from the booking so the log can
/// be filtered without consulting the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Ulid,
    pub booking_id: Option<Ulid>,
    pub user_id: Option<Ulid>,
    pub trainer_id: Option<Ulid>,
    pub actor: Actor,
    pub action: AuditAction,
    pub before: Option<BookingSnapshot>,
    pub after: Option<BookingSnapshot>,
    pub at: Ms,
}

// ── WAL events ───────────────────────────────────────────────────

/// The event types — flat, no nesting. This is the WAL record format.
///
/// Booking events carry the acting `Actor`, so one WAL record commits the
/// ledger mutation and its audit entry together (derived during apply).
/// `Snapshot*` variants are emitted only by compaction and apply without
/// generating fresh audit entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    WindowDefined {
        window: AvailabilityWindow,
        actor: Actor,
        at: Ms,
    },
    WindowRevoked {
        id: Ulid,
        trainer_id: Ulid,
        actor: Actor,
        at: Ms,
    },
    BookingCreated {
        booking: Booking,
        actor: Actor,
    },
    BookingModified {
        id: Ulid,
        trainer_id: Ulid,
        span: Span,
        message: Option<String>,
        actor: Actor,
        at: Ms,
    },
    BookingCancelled {
        id: Ulid,
        trainer_id: Ulid,
        message: Option<String>,
        actor: Actor,
        at: Ms,
    },
    BookingConfirmed {
        id: Ulid,
        trainer_id: Ulid,
        at: Ms,
    },
    BookingCompleted {
        id: Ulid,
        trainer_id: Ulid,
        at: Ms,
    },
    NoticeScheduled {
        notice: NotificationEvent,
    },
    NoticeSent {
        id: Ulid,
        at: Ms,
    },
    NoticeRetry {
        id: Ulid,
        attempts: u32,
        next_attempt_at: Ms,
    },
    NoticeAbandoned {
        id: Ulid,
        at: Ms,
    },
    /// The booking moved; the pending notice now fires at a new time.
    NoticeRetargeted {
        id: Ulid,
        fire_at: Ms,
    },
    /// The booking left its schedulable state; the pending notice must
    /// never be delivered.
    NoticeObsolete {
        id: Ulid,
        at: Ms,
    },
    SnapshotWindow {
        window: AvailabilityWindow,
    },
    SnapshotBooking {
        booking: Booking,
    },
    SnapshotAudit {
        record: AuditRecord,
    },
}

// ── Per-trainer schedule state ───────────────────────────────────

/// All scheduling state for one trainer: availability windows plus the
/// booking ledger, bookings kept sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct TrainerSchedule {
    pub trainer_id: Ulid,
    pub windows: Vec<AvailabilityWindow>,
    pub bookings: Vec<Booking>,
}

impl TrainerSchedule {
    pub fn new(trainer_id: Ulid) -> Self {
        Self {
            trainer_id,
            windows: Vec::new(),
            bookings: Vec::new(),
        }
    }

    /// Insert a booking maintaining sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    /// Move a booking to a new span, keeping the vec sorted.
    pub fn reslot_booking(&mut self, id: &Ulid, span: Span) -> Option<&mut Booking> {
        let pos = self.bookings.iter().position(|b| b.id == *id)?;
        let mut booking = self.bookings.remove(pos);
        booking.span = span;
        let pos = self
            .bookings
            .binary_search_by_key(&span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
        Some(&mut self.bookings[pos])
    }

    /// Bookings still occupying their slot that overlap the query window.
    /// Binary search skips everything starting at or after `query.end`.
    pub fn occupying_overlapping(&self, query: Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start && b.status.occupies_slot())
    }

    pub fn insert_window(&mut self, window: AvailabilityWindow) {
        self.windows.push(window);
    }

    pub fn window(&self, id: &Ulid) -> Option<&AvailabilityWindow> {
        self.windows.iter().find(|w| w.id == *id)
    }

    pub fn window_mut(&mut self, id: &Ulid) -> Option<&mut AvailabilityWindow> {
        self.windows.iter_mut().find(|w| w.id == *id)
    }

    pub fn active_windows(&self) -> impl Iterator<Item = &AvailabilityWindow> {
        self.windows.iter().filter(|w| w.active)
    }
}

// ── Query filter ─────────────────────────────────────────────────

/// AND-combined booking filter. `None` fields match everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct BookingFilter {
    pub user_id: Option<Ulid>,
    pub trainer_id: Option<Ulid>,
    pub center_id: Option<Ulid>,
    pub range: Option<Span>,
}

impl BookingFilter {
    pub fn matches(&self, booking: &Booking) -> bool {
        if let Some(uid) = self.user_id
            && booking.user_id != uid {
                return false;
            }
        if let Some(tid) = self.trainer_id
            && booking.trainer_id != tid {
                return false;
            }
        if let Some(cid) = self.center_id
            && booking.center_id != cid {
                return false;
            }
        if let Some(range) = self.range
            && !range.overlaps(&booking.span) {
                return false;
            }
        true
    }
}
