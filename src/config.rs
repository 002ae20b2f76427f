use std::time::Duration;

use crate::model::{HOUR_MS, Ms};

/// Engine policy knobs. Every field has a sensible default and can be
/// overridden through `ROTA_*` environment variables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// When true, new bookings commit as `Pending` and wait for the payment
    /// collaborator to call `confirm_payment`. When false they commit as
    /// `Confirmed` directly.
    pub require_payment_confirmation: bool,
    /// Bookings must start at least this far in the future.
    pub min_lead_ms: Ms,
    /// Users may cancel/modify only while `now < start - cancel_window_ms`.
    pub cancel_window_ms: Ms,
    /// Reminders fire this long before the session start.
    pub reminder_lead_ms: Ms,
    /// Bounded wait for the per-trainer scheduling lock.
    pub lock_timeout: Duration,
    /// Background sweep cadence.
    pub sweep_interval: Duration,
    /// First delivery retry delay; doubles per attempt.
    pub delivery_retry_base: Duration,
    /// Delivery attempts before a notice is abandoned as permanently failed.
    pub max_delivery_attempts: u32,
    /// Compact the WAL once this many events have been appended since the
    /// last compaction.
    pub compact_threshold: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            require_payment_confirmation: false,
            min_lead_ms: 2 * HOUR_MS,
            cancel_window_ms: 24 * HOUR_MS,
            reminder_lead_ms: 48 * HOUR_MS,
            lock_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(30),
            delivery_retry_base: Duration::from_secs(30),
            max_delivery_attempts: 5,
            compact_threshold: 1000,
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|s| s.parse().ok())
}

impl EngineConfig {
    /// Build a config from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            require_payment_confirmation: env_parse("ROTA_REQUIRE_PAYMENT_CONFIRMATION")
                .unwrap_or(d.require_payment_confirmation),
            min_lead_ms: env_parse::<Ms>("ROTA_MIN_LEAD_HOURS")
                .map(|h| h * HOUR_MS)
                .unwrap_or(d.min_lead_ms),
            cancel_window_ms: env_parse::<Ms>("ROTA_CANCEL_WINDOW_HOURS")
                .map(|h| h * HOUR_MS)
                .unwrap_or(d.cancel_window_ms),
            reminder_lead_ms: env_parse::<Ms>("ROTA_REMINDER_LEAD_HOURS")
                .map(|h| h * HOUR_MS)
                .unwrap_or(d.reminder_lead_ms),
            lock_timeout: env_parse::<u64>("ROTA_LOCK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(d.lock_timeout),
            sweep_interval: env_parse::<u64>("ROTA_SWEEP_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.sweep_interval),
            delivery_retry_base: env_parse::<u64>("ROTA_DELIVERY_RETRY_BASE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.delivery_retry_base),
            max_delivery_attempts: env_parse("ROTA_MAX_DELIVERY_ATTEMPTS")
                .unwrap_or(d.max_delivery_attempts),
            compact_threshold: env_parse("ROTA_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
        }
    }
}
