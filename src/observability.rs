use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: bookings committed. Labels: none (one counter per transition).
pub const BOOKINGS_CREATED_TOTAL: &str = "rota_bookings_created_total";
pub const BOOKINGS_MODIFIED_TOTAL: &str = "rota_bookings_modified_total";
pub const BOOKINGS_CANCELLED_TOTAL: &str = "rota_bookings_cancelled_total";
pub const BOOKINGS_COMPLETED_TOTAL: &str = "rota_bookings_completed_total";

/// Counter: create/modify attempts rejected as double bookings.
pub const BOOKING_CONFLICTS_TOTAL: &str = "rota_booking_conflicts_total";

// ── Notification pipeline ───────────────────────────────────────

pub const NOTICES_SCHEDULED_TOTAL: &str = "rota_notices_scheduled_total";
pub const NOTICES_SENT_TOTAL: &str = "rota_notices_sent_total";

/// Counter: notices abandoned after exhausting delivery retries.
pub const NOTICES_ABANDONED_TOTAL: &str = "rota_notices_abandoned_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: full sweep pass duration in seconds.
pub const SWEEP_DURATION_SECONDS: &str = "rota_sweep_duration_seconds";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rota_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rota_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if
/// `port` is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Default tracing subscriber for embedding applications that don't bring
/// their own.
pub fn init_tracing() {
    tracing_subscriber::fmt::init();
}
