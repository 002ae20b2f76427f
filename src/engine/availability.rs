use chrono::{DateTime, Months, Utc};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::arbiter::now_ms;
use super::{Engine, EngineError, Event};

// ── Recurrence expansion ─────────────────────────────────────────

/// Lazy, finite, restartable expansion of a window's recurrence rule.
///
/// Yields full (unclamped) occurrence spans that overlap `range`, in
/// chronological order. The iterator is `Clone`; cloning restarts it.
/// Recurrence is expanded on read, never materialized indefinitely.
#[derive(Debug, Clone)]
pub struct Occurrences {
    base: Span,
    recurrence: Recurrence,
    until: Option<Ms>,
    range: Span,
    k: u32,
}

/// Expand `window` over `range`. `until` bounds the pattern: occurrences
/// starting at or after it are not produced.
pub fn occurrences(window: &AvailabilityWindow, range: Span) -> Occurrences {
    let k = match window.recurrence {
        Recurrence::None => 0,
        Recurrence::Daily => first_index(&window.first, range.start, DAY_MS),
        Recurrence::Weekly => first_index(&window.first, range.start, WEEK_MS),
        // Months vary in length; start from a conservative estimate and
        // let `next` skip forward.
        Recurrence::Monthly => {
            let gap = range.start - window.first.end;
            if gap > 0 { (gap / (31 * DAY_MS)) as u32 } else { 0 }
        }
    };
    Occurrences {
        base: window.first,
        recurrence: window.recurrence,
        until: window.until,
        range,
        k,
    }
}

/// Smallest k >= 0 such that `base` shifted by k periods ends after `from`.
fn first_index(base: &Span, from: Ms, period: Ms) -> u32 {
    let gap = from - base.end;
    if gap < 0 {
        0
    } else {
        (gap.div_euclid(period) + 1) as u32
    }
}

impl Occurrences {
    fn nth_span(&self, k: u32) -> Option<Span> {
        match self.recurrence {
            Recurrence::None => (k == 0).then_some(self.base),
            Recurrence::Daily => {
                let shift = k as Ms * DAY_MS;
                Some(Span::new(self.base.start + shift, self.base.end + shift))
            }
            Recurrence::Weekly => {
                let shift = k as Ms * WEEK_MS;
                Some(Span::new(self.base.start + shift, self.base.end + shift))
            }
            Recurrence::Monthly => {
                // chrono clamps the day-of-month (Jan 31 + 1mo = Feb 28).
                let start = DateTime::<Utc>::from_timestamp_millis(self.base.start)?
                    .checked_add_months(Months::new(k))?
                    .timestamp_millis();
                Some(Span::new(start, start + self.base.duration_ms()))
            }
        }
    }
}

impl Iterator for Occurrences {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        loop {
            let occ = self.nth_span(self.k)?;
            self.k += 1;
            if let Some(until) = self.until
                && occ.start >= until {
                    return None;
                }
            if occ.start >= self.range.end {
                return None;
            }
            if occ.end > self.range.start {
                return Some(occ);
            }
            // Entirely before the range — keep stepping.
        }
    }
}

/// Merge sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

fn validate_window_span(span: &Span) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidRange("window start must be before end"));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::InvalidRange("timestamp out of range"));
    }
    if span.duration_ms() > MAX_WINDOW_DURATION_MS {
        return Err(EngineError::InvalidRange("window too wide"));
    }
    Ok(())
}

/// Only the trainer who owns the schedule, or an admin, may change it.
fn authorize_schedule_owner(trainer_id: Ulid, actor: &Actor) -> Result<(), EngineError> {
    match actor.role {
        Role::Admin => Ok(()),
        Role::Trainer if actor.id == trainer_id => Ok(()),
        Role::Trainer => Err(EngineError::Authorization(
            "trainers may only manage their own availability",
        )),
        Role::User | Role::System => Err(EngineError::Authorization(
            "only the owning trainer or an admin may manage availability",
        )),
    }
}

// ── Availability store operations ────────────────────────────────

impl Engine {
    /// Define a new availability window for a trainer at a center.
    ///
    /// Fails with `Conflict` if any occurrence within the check horizon
    /// would overlap an existing active window of the same trainer — the
    /// no-overlapping-windows invariant is enforced at write time so reads
    /// never have to resolve ambiguity.
    pub async fn define_availability(
        &self,
        trainer_id: Ulid,
        center_id: Ulid,
        first: Span,
        recurrence: Recurrence,
        until: Option<Ms>,
        actor: Actor,
    ) -> Result<AvailabilityWindow, EngineError> {
        validate_window_span(&first)?;
        if let Some(u) = until
            && u <= first.start {
                return Err(EngineError::InvalidRange("until precedes the first occurrence"));
            }
        authorize_schedule_owner(trainer_id, &actor)?;

        let mut guard = self.lock_trainer(trainer_id).await?;
        if guard.windows.len() >= MAX_WINDOWS_PER_TRAINER {
            return Err(EngineError::LimitExceeded("too many windows for trainer"));
        }

        let window = AvailabilityWindow {
            id: Ulid::new(),
            trainer_id,
            center_id,
            first,
            recurrence,
            until,
            active: true,
        };

        // Only future occurrences can collide with future bookings, so the
        // check starts at the later of now and the window start.
        let now = now_ms();
        let horizon_start = first.start.max(now);
        let horizon = Span::new(
            horizon_start,
            horizon_start
                .saturating_add(RECURRENCE_CHECK_HORIZON_MS)
                .min(MAX_VALID_TIMESTAMP_MS),
        );
        for occ in occurrences(&window, horizon) {
            for existing in guard.active_windows() {
                if occurrences(existing, occ).next().is_some() {
                    return Err(EngineError::Conflict(format!(
                        "overlaps active window {}",
                        existing.id
                    )));
                }
            }
        }

        let event = Event::WindowDefined {
            window: window.clone(),
            actor,
            at: now,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(window)
    }

    /// Expand a trainer's active windows at a center into concrete,
    /// non-overlapping spans clamped to `[from, to)`.
    pub async fn resolve_windows_in_range(
        &self,
        trainer_id: Ulid,
        center_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Span>, EngineError> {
        if from >= to {
            return Err(EngineError::InvalidRange("query start must be before end"));
        }
        if to - from > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let Some(guard) = self.read_trainer(trainer_id).await? else {
            return Ok(Vec::new());
        };

        let query = Span::new(from, to);
        let mut spans: Vec<Span> = Vec::new();
        for window in guard.active_windows().filter(|w| w.center_id == center_id) {
            for occ in occurrences(window, query) {
                if let Some(clamped) = occ.clamp_to(&query) {
                    spans.push(clamped);
                }
            }
        }
        spans.sort_by_key(|s| s.start);
        Ok(merge_overlapping(&spans))
    }

    /// Mark a window superseded. Fails with `Conflict` while active
    /// bookings depend on it, unless `force`, which cascades cancellation
    /// through the arbiter (same audit and notices as a trainer-initiated
    /// cancel). Returns the ids of cancelled bookings.
    pub async fn revoke_window(
        &self,
        window_id: Ulid,
        actor: Actor,
        force: bool,
    ) -> Result<Vec<Ulid>, EngineError> {
        let trainer_id = self
            .window_index
            .get(&window_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(window_id))?;

        let mut guard = self.lock_trainer(trainer_id).await?;
        let window = guard
            .window(&window_id)
            .cloned()
            .ok_or(EngineError::NotFound(window_id))?;
        if !window.active {
            return Err(EngineError::Conflict("window already revoked".into()));
        }
        authorize_schedule_owner(trainer_id, &actor)?;

        let dependents = dependent_bookings(&guard, &window);
        if !dependents.is_empty() && !force {
            return Err(EngineError::Conflict(format!(
                "{} active bookings depend on window {window_id}",
                dependents.len()
            )));
        }

        let now = now_ms();
        let mut cancelled = Vec::with_capacity(dependents.len());
        for id in dependents {
            let event = Event::BookingCancelled {
                id,
                trainer_id,
                message: Some("availability revoked".into()),
                actor,
                at: now,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            if let Some(booking) = guard.booking(&id) {
                cancelled.push(booking.clone());
            }
        }

        let event = Event::WindowRevoked { id: window_id, trainer_id, actor, at: now };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        // Notices go out after the transaction commits.
        for booking in &cancelled {
            self.notify_booking_event(booking, NoticeKind::Cancelled, actor, now).await;
        }
        Ok(cancelled.into_iter().map(|b| b.id).collect())
    }
}

/// Bookings still occupying a slot that only this window covers. A booking
/// fully covered by some other active window does not block revocation.
fn dependent_bookings(rs: &TrainerSchedule, window: &AvailabilityWindow) -> Vec<Ulid> {
    rs.bookings
        .iter()
        .filter(|b| b.status.occupies_slot())
        .filter(|b| {
            let in_this = occurrences(window, b.span).any(|occ| occ.contains_span(&b.span));
            if !in_this {
                return false;
            }
            let covered_elsewhere = rs
                .active_windows()
                .filter(|w| w.id != window.id && w.center_id == b.center_id)
                .any(|w| occurrences(w, b.span).any(|occ| occ.contains_span(&b.span)));
            !covered_elsewhere
        })
        .map(|b| b.id)
        .collect()
}

/// True if some active window of `rs` at `center_id` fully contains `span`.
pub(super) fn span_within_availability(
    rs: &TrainerSchedule,
    center_id: Ulid,
    span: &Span,
) -> bool {
    rs.active_windows()
        .filter(|w| w.center_id == center_id)
        .any(|w| occurrences(w, *span).any(|occ| occ.contains_span(span)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = HOUR_MS;

    fn window(start: Ms, end: Ms, recurrence: Recurrence, until: Option<Ms>) -> AvailabilityWindow {
        AvailabilityWindow {
            id: Ulid::new(),
            trainer_id: Ulid::new(),
            center_id: Ulid::new(),
            first: Span::new(start, end),
            recurrence,
            until,
            active: true,
        }
    }

    #[test]
    fn one_time_window_single_occurrence() {
        let w = window(10 * H, 12 * H, Recurrence::None, None);
        let occs: Vec<_> = occurrences(&w, Span::new(0, 1000 * H)).collect();
        assert_eq!(occs, vec![Span::new(10 * H, 12 * H)]);
    }

    #[test]
    fn one_time_window_outside_range() {
        let w = window(10 * H, 12 * H, Recurrence::None, None);
        assert_eq!(occurrences(&w, Span::new(12 * H, 20 * H)).count(), 0);
        assert_eq!(occurrences(&w, Span::new(0, 10 * H)).count(), 0);
    }

    #[test]
    fn daily_expansion() {
        let w = window(9 * H, 10 * H, Recurrence::Daily, None);
        let range = Span::new(0, 3 * DAY_MS);
        let occs: Vec<_> = occurrences(&w, range).collect();
        assert_eq!(
            occs,
            vec![
                Span::new(9 * H, 10 * H),
                Span::new(DAY_MS + 9 * H, DAY_MS + 10 * H),
                Span::new(2 * DAY_MS + 9 * H, 2 * DAY_MS + 10 * H),
            ]
        );
    }

    #[test]
    fn weekly_three_weeks_three_occurrences() {
        let w = window(9 * H, 11 * H, Recurrence::Weekly, None);
        let range = Span::new(0, 3 * WEEK_MS);
        let occs: Vec<_> = occurrences(&w, range).collect();
        assert_eq!(occs.len(), 3);
        for (i, occ) in occs.iter().enumerate() {
            assert_eq!(occ.start, i as Ms * WEEK_MS + 9 * H);
            assert_eq!(occ.duration_ms(), 2 * H);
        }
        // Pairwise disjoint
        for pair in occs.windows(2) {
            assert!(!pair[0].overlaps(&pair[1]));
        }
    }

    #[test]
    fn expansion_skips_to_range() {
        let w = window(9 * H, 10 * H, Recurrence::Daily, None);
        let range = Span::new(10 * DAY_MS, 12 * DAY_MS);
        let occs: Vec<_> = occurrences(&w, range).collect();
        assert_eq!(occs.len(), 2);
        assert_eq!(occs[0].start, 10 * DAY_MS + 9 * H);
    }

    #[test]
    fn until_bounds_the_pattern() {
        let w = window(9 * H, 10 * H, Recurrence::Daily, Some(2 * DAY_MS));
        let occs: Vec<_> = occurrences(&w, Span::new(0, 30 * DAY_MS)).collect();
        // Day 0 and day 1; day 2 starts at 2d+9h >= until.
        assert_eq!(occs.len(), 2);
    }

    #[test]
    fn monthly_steps_calendar_months() {
        // 2025-01-15 10:00 UTC
        let base = 1_736_935_200_000;
        let w = window(base, base + 2 * H, Recurrence::Monthly, None);
        let range = Span::new(base, base + 100 * DAY_MS);
        let occs: Vec<_> = occurrences(&w, range).collect();
        assert_eq!(occs.len(), 4); // Jan, Feb, Mar, Apr 15th
        // Jan → Feb is 31 days at the same wall-clock time.
        assert_eq!(occs[1].start - occs[0].start, 31 * DAY_MS);
        // Feb → Mar is 28 days (2025 is not a leap year).
        assert_eq!(occs[2].start - occs[1].start, 28 * DAY_MS);
        for occ in &occs {
            assert_eq!(occ.duration_ms(), 2 * H);
        }
    }

    #[test]
    fn occurrences_restartable() {
        let w = window(9 * H, 10 * H, Recurrence::Daily, None);
        let it = occurrences(&w, Span::new(0, 5 * DAY_MS));
        let first: Vec<_> = it.clone().collect();
        let second: Vec<_> = it.collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), 5);
    }

    #[test]
    fn merge_overlapping_spans() {
        let spans = vec![
            Span::new(0, 10),
            Span::new(5, 15),
            Span::new(15, 20), // adjacent merges too
            Span::new(30, 40),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(0, 20), Span::new(30, 40)]
        );
    }

    #[test]
    fn window_span_validation() {
        assert!(validate_window_span(&Span { start: 10, end: 10 }).is_err());
        assert!(validate_window_span(&Span { start: -5, end: 10 }).is_err());
        assert!(
            validate_window_span(&Span::new(0, MAX_WINDOW_DURATION_MS + 1)).is_err()
        );
        assert!(validate_window_span(&Span::new(9 * H, 17 * H)).is_ok());
    }

    #[test]
    fn schedule_owner_authorization() {
        let trainer = Ulid::new();
        assert!(authorize_schedule_owner(trainer, &Actor::new(trainer, Role::Trainer)).is_ok());
        assert!(authorize_schedule_owner(trainer, &Actor::new(Ulid::new(), Role::Admin)).is_ok());
        assert!(
            authorize_schedule_owner(trainer, &Actor::new(Ulid::new(), Role::Trainer)).is_err()
        );
        assert!(authorize_schedule_owner(trainer, &Actor::new(trainer, Role::User)).is_err());
    }

    #[test]
    fn containment_check_spans_occurrences() {
        let mut rs = TrainerSchedule::new(Ulid::new());
        let mut w = window(9 * H, 17 * H, Recurrence::Daily, None);
        let center = w.center_id;
        w.trainer_id = rs.trainer_id;
        rs.insert_window(w);

        // Inside the day-3 occurrence
        let inside = Span::new(3 * DAY_MS + 10 * H, 3 * DAY_MS + 11 * H);
        assert!(span_within_availability(&rs, center, &inside));

        // Crosses the end of an occurrence
        let crossing = Span::new(3 * DAY_MS + 16 * H, 3 * DAY_MS + 18 * H);
        assert!(!span_within_availability(&rs, center, &crossing));

        // Right center required
        assert!(!span_within_availability(&rs, Ulid::new(), &inside));
    }
}
