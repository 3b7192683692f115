//! Prometheus metrics for the room service.
//!
//! Naming: `rs_` prefix, `_total` suffix for counters, `_seconds` suffix for
//! duration histograms.
//!
//! # Cardinality
//!
//! Every label is bounded by code:
//! - `outcome`: join outcomes and grace expiry outcomes (< 10 values)
//! - `reason`: relay rejection reasons (3 values)
//! - `kind`: relayed message kinds (2 values)
//! - `actor_type`: 2 values (registry, connection)
//! - `message_type`: client message kinds (5 values)
//!
//! Room codes, connection ids and identities are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle used to render
/// `/metrics`.
///
/// Must be called before any metric is recorded.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        // Registry round trips stay well under a millisecond when healthy
        .set_buckets_for_metric(
            Matcher::Prefix("rs_message".to_string()),
            &[
                0.0001, 0.0005, 0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250,
            ],
        )
        .map_err(|e| format!("Failed to set message latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Metric: `rs_rooms_active`
pub fn set_rooms_active(count: usize) {
    // usize to f64 is exact below 2^53; the room ceiling keeps us far below
    #[allow(clippy::cast_precision_loss)]
    gauge!("rs_rooms_active").set(count as f64);
}

/// Metric: `rs_connections_active`
pub fn set_connections_active(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rs_connections_active").set(count as f64);
}

/// Metric: `rs_reconnecting_identities`
///
/// Member slots currently held open by a grace timer.
pub fn set_reconnecting_identities(count: usize) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("rs_reconnecting_identities").set(count as f64);
}

// ============================================================================
// Counters
// ============================================================================

/// Metric: `rs_rooms_created_total`
pub fn record_room_created() {
    counter!("rs_rooms_created_total").increment(1);
}

/// Metric: `rs_room_joins_total`
/// Labels: `outcome` (joined, rejoined, or an error code such as `room_full`)
pub fn record_room_join(outcome: &str) {
    counter!("rs_room_joins_total", "outcome" => outcome.to_string()).increment(1);
}

/// Metric: `rs_grace_expirations_total`
/// Labels: `outcome` (`peer_left`, `room_deleted`)
pub fn record_grace_expiration(outcome: &str) {
    counter!("rs_grace_expirations_total", "outcome" => outcome.to_string()).increment(1);
}

/// Metric: `rs_signals_relayed_total`
/// Labels: `kind` (signal, `application_sync`)
pub fn record_signal_relayed(kind: &str) {
    counter!("rs_signals_relayed_total", "kind" => kind.to_string()).increment(1);
}

/// Metric: `rs_signals_rejected_total`
/// Labels: `reason`
///
/// A sustained non-zero rate means a client is addressing peers outside its
/// room.
pub fn record_signal_rejected(reason: &str) {
    counter!("rs_signals_rejected_total", "reason" => reason.to_string()).increment(1);
}

/// Metric: `rs_outbound_dropped_total`
/// Labels: `actor_type`
pub fn record_outbound_dropped(actor_type: &str) {
    counter!("rs_outbound_dropped_total", "actor_type" => actor_type.to_string()).increment(1);
}

// ============================================================================
// Histograms
// ============================================================================

/// Metric: `rs_message_latency_seconds`
/// Labels: `message_type`
///
/// Time from frame decode to the registry finishing the request.
pub fn record_message_latency(message_type: &str, duration: Duration) {
    histogram!("rs_message_latency_seconds", "message_type" => message_type.to_string())
        .record(duration.as_secs_f64());
}
