use std::net::SocketAddr;

use crate::protocol::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "bunkd_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "bunkd_request_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: resolved booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "bunkd_bookings_total";

/// Counter: cancellations and completions. Labels: kind.
pub const RELEASES_TOTAL: &str = "bunkd_releases_total";

/// Counter: store calls retried after a transient failure. Labels: op.
pub const STORE_RETRIES_TOTAL: &str = "bunkd_store_retries_total";

/// Counter: compensating actions attempted. Labels: action.
pub const COMPENSATIONS_TOTAL: &str = "bunkd_compensations_total";

/// Counter: compensating actions that themselves failed and need manual reconciliation.
pub const COMPENSATION_FAILURES_TOTAL: &str = "bunkd_compensation_failures_total";

/// Counter: drift corrected by the reconciler. Labels: kind.
pub const RECONCILE_FIXES_TOTAL: &str = "bunkd_reconcile_fixes_total";

/// Counter: confirmed bookings cancelled by the unpaid-expiry reaper.
pub const UNPAID_EXPIRED_TOTAL: &str = "bunkd_unpaid_expired_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bunkd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bunkd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bunkd_connections_rejected_total";

/// Gauge: number of loaded hostels.
pub const HOSTELS_ACTIVE: &str = "bunkd_hostels_active";

/// Counter: handshake failures.
pub const AUTH_FAILURES_TOTAL: &str = "bunkd_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bunkd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bunkd_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Map a request to a short label for metrics.
pub fn request_label(req: &Request) -> &'static str {
    match req {
        Request::Hello { .. } => "hello",
        Request::CreateRoom { .. } => "create_room",
        Request::UpdateRoom { .. } => "update_room",
        Request::RetireRoom { .. } => "retire_room",
        Request::RemoveRoom { .. } => "remove_room",
        Request::RegisterStudent { .. } => "register_student",
        Request::Book { .. } => "book",
        Request::Cancel { .. } => "cancel",
        Request::Complete { .. } => "complete",
        Request::PaymentConfirmed { .. } => "payment_confirmed",
        Request::GetRoom { .. } => "get_room",
        Request::RoomStatus { .. } => "room_status",
        Request::ListRooms { .. } => "list_rooms",
        Request::Occupancy { .. } => "occupancy",
        Request::GetBooking { .. } => "get_booking",
        Request::BookingsByRoom { .. } => "bookings_by_room",
        Request::BookingsByStudent { .. } => "bookings_by_student",
        Request::BookingsByStatus { .. } => "bookings_by_status",
        Request::BookingHistory { .. } => "booking_history",
        Request::Reconcile => "reconcile",
        Request::Watch { .. } => "watch",
        Request::Unwatch { .. } => "unwatch",
    }
}
