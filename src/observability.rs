use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotwise_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotwise_query_duration_seconds";

/// Counter: reservation attempts. Labels: outcome (reserved, conflict, policy, error).
pub const RESERVATIONS_TOTAL: &str = "slotwise_reservations_total";

/// Counter: approval workflow transitions. Labels: action.
pub const TRANSITIONS_TOTAL: &str = "slotwise_transitions_total";

/// Counter: notification deliveries. Labels: status (sent, failed).
pub const NOTIFICATIONS_TOTAL: &str = "slotwise_notifications_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotwise_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotwise_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotwise_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "slotwise_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotwise_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotwise_wal_flush_batch_size";

/// Install the fmt subscriber. `filter` uses `RUST_LOG` syntax.
pub fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|e| {
        eprintln!("invalid log filter {filter:?} ({e}), falling back to info");
        EnvFilter::new("info")
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertProvider { .. } => "insert_provider",
        Command::DeleteProvider { .. } => "delete_provider",
        Command::SetProviderAvailable { .. } => "set_provider_available",
        Command::InsertWeeklySlots { .. } => "insert_weekly_slots",
        Command::ClearWeeklySlots { .. } => "clear_weekly_slots",
        Command::InsertDateSlots { .. } => "insert_date_slots",
        Command::DeleteDateSlots { .. } => "delete_date_slots",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::SelectProviders => "select_providers",
        Command::SelectWeeklySlots { .. } => "select_weekly_slots",
        Command::SelectDateSlots { .. } => "select_date_slots",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectTodayAvailability { .. } => "select_today_availability",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectQuota { .. } => "select_quota",
    }
}
