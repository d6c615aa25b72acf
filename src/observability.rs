use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total commands executed. Labels: command, status.
pub const COMMANDS_TOTAL: &str = "paddock_commands_total";

/// Histogram: command latency in seconds. Labels: command.
pub const COMMAND_DURATION_SECONDS: &str = "paddock_command_duration_seconds";

/// Counter: confirmed bookings.
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "paddock_bookings_confirmed_total";

/// Counter: cancelled bookings.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "paddock_bookings_cancelled_total";

/// Counter: claims rejected for insufficient capacity.
pub const CLAIMS_REJECTED_TOTAL: &str = "paddock_claims_rejected_total";

/// Counter: release clamps and availability drift repairs.
pub const CONSISTENCY_ANOMALIES_TOTAL: &str = "paddock_consistency_anomalies_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "paddock_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "paddock_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "paddock_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "paddock_tenants_active";

/// Counter: login failures.
pub const AUTH_FAILURES_TOTAL: &str = "paddock_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "paddock_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "paddock_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn command_label(req: &Request) -> &'static str {
    match req {
        Request::Open { .. } => "open",
        Request::Login { .. } => "login",
        Request::Logout => "logout",
        Request::CreateSlot { .. } => "create_slot",
        Request::SetPrice { .. } => "set_price",
        Request::Book { .. } => "book",
        Request::Cancel { .. } => "cancel",
        Request::Slots => "slots",
        Request::Availability { .. } => "availability",
        Request::GetBooking { .. } => "get_booking",
        Request::Ticket { .. } => "ticket",
        Request::WatchAvailability { .. } => "watch_availability",
        Request::WatchBookings => "watch_bookings",
        Request::WatchAllBookings => "watch_all_bookings",
        Request::Unwatch { .. } => "unwatch",
    }
}
