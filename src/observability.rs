use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fuhrpark_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fuhrpark_query_duration_seconds";

/// Counter: reservations refused because of an overlapping active reservation.
pub const CONFLICTS_REJECTED_TOTAL: &str = "fuhrpark_conflicts_rejected_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "fuhrpark_connections_active";
pub const CONNECTIONS_TOTAL: &str = "fuhrpark_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fuhrpark_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fuhrpark_wal_flush_duration_seconds";

/// Histogram: events per WAL group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "fuhrpark_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a parsed statement.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertVehicle { .. } => "insert_vehicle",
        Command::UpdateVehicle { .. } => "update_vehicle",
        Command::DeleteVehicle { .. } => "delete_vehicle",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::BatchInsertReservations { .. } => "batch_insert_reservations",
        Command::RescheduleReservation { .. } => "reschedule_reservation",
        Command::SetReservationStatus { .. } => "set_reservation_status",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectVehicles => "select_vehicles",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectInspections => "select_inspections",
    }
}
