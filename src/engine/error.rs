use ulid::Ulid;

use crate::model::Ms;

/// Failure taxonomy of the scheduling core.
///
/// Validation failures (`InvalidRange`, `AvailabilityNotFound`,
/// `WindowClosed`, `Authorization`) are caller errors and must not be
/// retried. Concurrency failures (`DoubleBooking`, `StaleVersion`,
/// `LockTimeout`) are retryable after refetching state. `Storage` is fatal
/// to the operation and must never be read as a business-rule rejection.
#[derive(Debug)]
pub enum EngineError {
    InvalidRange(&'static str),
    /// No active availability window covers the requested range.
    AvailabilityNotFound(Ulid),
    /// The slot is taken by the referenced booking.
    DoubleBooking(Ulid),
    /// User-initiated change inside the cancellation window.
    WindowClosed { starts_at: Ms },
    Authorization(&'static str),
    /// State conflict: overlapping window definition, revoke with
    /// dependent bookings, or an invalid status transition.
    Conflict(String),
    /// The presented version is stale; refetch and retry.
    StaleVersion { actual: u64 },
    /// Per-trainer lock wait expired.
    LockTimeout(Ulid),
    NotFound(Ulid),
    LimitExceeded(&'static str),
    /// WAL unavailable — the operation did not commit.
    Storage(String),
}

impl EngineError {
    /// True for conditions the caller may retry after refreshing state.
    /// The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::DoubleBooking(_)
                | EngineError::StaleVersion { .. }
                | EngineError::LockTimeout(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidRange(msg) => write!(f, "invalid range: {msg}"),
            EngineError::AvailabilityNotFound(trainer) => {
                write!(f, "no availability window covers the range for trainer {trainer}")
            }
            EngineError::DoubleBooking(id) => write!(f, "slot taken by booking {id}"),
            EngineError::WindowClosed { starts_at } => {
                write!(f, "change window closed for session starting at {starts_at}")
            }
            EngineError::Authorization(msg) => write!(f, "not authorized: {msg}"),
            EngineError::Conflict(msg) => write!(f, "conflict: {msg}"),
            EngineError::StaleVersion { actual } => {
                write!(f, "stale version: booking is at version {actual}")
            }
            EngineError::LockTimeout(trainer) => {
                write!(f, "timed out waiting for schedule lock of trainer {trainer}")
            }
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Storage(e) => write!(f, "storage unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability() {
        assert!(EngineError::DoubleBooking(Ulid::new()).is_retryable());
        assert!(EngineError::StaleVersion { actual: 3 }.is_retryable());
        assert!(EngineError::LockTimeout(Ulid::new()).is_retryable());
        assert!(!EngineError::InvalidRange("start after end").is_retryable());
        assert!(!EngineError::WindowClosed { starts_at: 0 }.is_retryable());
        assert!(!EngineError::Storage("disk gone".into()).is_retryable());
    }
}
