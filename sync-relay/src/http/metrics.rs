//! Prometheus metrics endpoint.

use crate::orchestrator::RelayOrchestrator;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::fmt::Write as _;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const CONTENT_TYPE_TEXT: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Prometheus metrics handler.
///
/// Gauges describe current state; counters are monotonic since startup.
pub async fn metrics_handler(
    Extension(relay): Extension<Arc<RelayOrchestrator>>,
) -> impl IntoResponse {
    let stats = relay.get_stats().await;
    let m = relay.metrics();

    let mut body = format!(
        r#"# HELP sync_relay_info Server information
# TYPE sync_relay_info gauge
sync_relay_info{{version="{version}",protocol="{protocol}"}} 1
"#,
        version = env!("CARGO_PKG_VERSION"),
        protocol = sync_types::PROTOCOL_VERSION,
    );

    let gauges = [
        ("sessions_active", "Active sessions", stats.sessions),
        (
            "connections_active",
            "Live connections",
            stats.connections.total_connections,
        ),
        ("connections_role_active", "Connections holding the active role", stats.connections.active),
        ("connections_role_passive", "Connections holding the passive role", stats.connections.passive),
        ("connections_role_connected", "Connections without a direction", stats.connections.connected),
    ];
    for (name, help, value) in gauges {
        let _ = write!(
            body,
            "\n# HELP sync_relay_{name} {help}\n# TYPE sync_relay_{name} gauge\nsync_relay_{name} {value}\n"
        );
    }

    let counters = [
        ("connections_total", "Channels accepted", m.connections_total.load(Ordering::Relaxed)),
        ("connections_rejected_total", "Channels refused", m.connections_rejected.load(Ordering::Relaxed)),
        ("frames_routed_total", "Frames relayed to peers", m.frames_routed.load(Ordering::Relaxed)),
        ("control_transfers_total", "Grants of the active role", m.control_transfers.load(Ordering::Relaxed)),
        ("direction_assignments_total", "Direction assignments sent", m.direction_assignments.load(Ordering::Relaxed)),
        ("sessions_created_total", "Sessions created", m.sessions_created.load(Ordering::Relaxed)),
        ("sessions_expired_total", "Sessions expired", relay.lifecycle().expired_total()),
        ("rate_limit_hits_total", "Rate limit rejections", m.rate_limit_hits.load(Ordering::Relaxed)),
        ("errors_total", "Protocol errors", m.errors_total.load(Ordering::Relaxed)),
    ];
    for (name, help, value) in counters {
        let _ = write!(
            body,
            "\n# HELP sync_relay_{name} {help}\n# TYPE sync_relay_{name} counter\nsync_relay_{name} {value}\n"
        );
    }

    ([(CONTENT_TYPE, CONTENT_TYPE_TEXT)], body)
}
