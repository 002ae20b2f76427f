//! Hard limits. Everything a caller can grow without bound is capped here.

use crate::model::Ms;

/// Reject timestamps before the unix epoch.
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;

/// Reject timestamps after 2100-01-01. Catches unit confusion (seconds vs ms).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single session longer than this is a caller bug.
pub const MAX_SESSION_DURATION_MS: Ms = 12 * 3_600_000;

/// An availability window occurrence longer than this is a caller bug.
pub const MAX_WINDOW_DURATION_MS: Ms = 7 * 86_400_000;

/// Widest range accepted by availability/booking range queries.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 86_400_000;

/// How far ahead recurring windows are expanded when checking the
/// no-overlapping-windows invariant at definition time.
pub const RECURRENCE_CHECK_HORIZON_MS: Ms = 366 * 86_400_000;

pub const MAX_WINDOWS_PER_TRAINER: usize = 4_096;

pub const MAX_BOOKINGS_PER_TRAINER: usize = 65_536;

/// Cancellation/modification note attached by the actor.
pub const MAX_MESSAGE_LEN: usize = 1_024;
