use std::net::SocketAddr;

// ── Booking metrics ─────────────────────────────────────────────

/// Counter: reservations created. Labels: facility, status, excess.
pub const RESERVATIONS_CREATED_TOTAL: &str = "gatehouse_reservations_created_total";

/// Counter: booking requests turned away. Labels: reason.
pub const RESERVATIONS_REJECTED_TOTAL: &str = "gatehouse_reservations_rejected_total";

/// Counter: status transitions on existing reservations. Labels: transition.
pub const TRANSITIONS_TOTAL: &str = "gatehouse_transitions_total";

/// Counter: notification requests emitted. Labels: template.
pub const NOTIFICATIONS_TOTAL: &str = "gatehouse_notifications_total";

// ── Maintenance metrics ─────────────────────────────────────────

/// Histogram: nightly task duration in seconds. Labels: task.
pub const MAINTENANCE_DURATION_SECONDS: &str = "gatehouse_maintenance_duration_seconds";

/// Counter: nightly task failures. Labels: task.
pub const MAINTENANCE_FAILURES_TOTAL: &str = "gatehouse_maintenance_task_failures_total";

// ── Journal metrics ─────────────────────────────────────────────

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "gatehouse_journal_flush_duration_seconds";

/// Histogram: journal group-commit batch size (records per flush).
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "gatehouse_journal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
