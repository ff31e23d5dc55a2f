use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "turnstile_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "turnstile_query_duration_seconds";

// ── Admission metrics ───────────────────────────────────────────

/// Counter: reservation attempts. Labels: outcome (booking status or error code).
pub const RESERVATIONS_TOTAL: &str = "turnstile_reservations_total";

/// Counter: cancellation attempts. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "turnstile_cancellations_total";

/// Counter: waitlist promotions.
pub const PROMOTIONS_TOTAL: &str = "turnstile_promotions_total";

/// Counter: check-ins and no-show marks. Labels: status.
pub const ATTENDANCE_MARKS_TOTAL: &str = "turnstile_attendance_marks_total";

/// Counter: transactions retried after a lock conflict. Labels: op.
pub const STORAGE_RETRIES_TOTAL: &str = "turnstile_storage_retries_total";

/// Histogram: engine operation latency in seconds, retries included. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "turnstile_operation_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "turnstile_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "turnstile_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "turnstile_connections_rejected_total";

/// Gauge: number of loaded organizations.
pub const TENANTS_ACTIVE: &str = "turnstile_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "turnstile_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "turnstile_wal_flush_batch_size";

/// Counter: commits dropped by the WAL writer because their deadline passed.
pub const WAL_COMMITS_EXPIRED_TOTAL: &str = "turnstile_wal_commits_expired_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on :{port}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertClass(_) => "insert_class",
        Command::CancelClass { .. } => "cancel_class",
        Command::SelectClass { .. } => "select_class",
        Command::InsertBooking { .. } => "reserve",
        Command::CancelBooking { .. } => "cancel",
        Command::CheckIn { .. } => "check_in",
        Command::MarkNoShow { .. } => "mark_no_show",
        Command::SelectBookings { .. } => "select_bookings",
        Command::InsertMembership { .. } => "set_membership",
        Command::ConfigureLimits { .. } => "configure_limits",
    }
}
