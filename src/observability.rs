use std::net::SocketAddr;

use crate::engine::BookingError;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "washslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "washslot_query_duration_seconds";

/// Counter: booking requests decided. Labels: outcome.
pub const BOOKING_REQUESTS_TOTAL: &str = "washslot_booking_requests_total";

/// Counter: booking writes re-run after losing a slot race.
pub const BOOKING_WRITE_RETRIES_TOTAL: &str = "washslot_booking_write_retries_total";

/// Counter: cancellation attempts. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "washslot_cancellations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "washslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "washslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "washslot_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "washslot_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "washslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "washslot_wal_flush_batch_size";

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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::UpsertMachine { .. } => "upsert_machine",
        Command::RetireMachine { .. } => "retire_machine",
        Command::SelectMachines { .. } => "select_machines",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
    }
}

/// Outcome label for booking and cancellation counters.
pub fn outcome_label<T>(result: &Result<T, BookingError>) -> &'static str {
    match result {
        Ok(_) => "accepted",
        Err(BookingError::InvalidInterval) => "invalid_interval",
        Err(BookingError::UnknownMachine(_)) => "unknown_machine",
        Err(BookingError::Overlap { .. }) => "overlap",
        Err(BookingError::NotAuthorized) => "not_authorized",
        Err(BookingError::LimitExceeded(_)) => "limit_exceeded",
        Err(BookingError::StoreUnavailable(_)) => "store_unavailable",
    }
}
