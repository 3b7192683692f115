//! Probes and Prometheus metrics.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `rs_rooms_active` | Gauge | none | Live rooms |
//! | `rs_connections_active` | Gauge | none | Open signaling channels |
//! | `rs_reconnecting_identities` | Gauge | none | Slots held by a grace timer |
//! | `rs_rooms_created_total` | Counter | none | Rooms created |
//! | `rs_room_joins_total` | Counter | `outcome` | Join attempts |
//! | `rs_grace_expirations_total` | Counter | `outcome` | Grace timers that ran out |
//! | `rs_signals_relayed_total` | Counter | `kind` | Relayed payloads |
//! | `rs_signals_rejected_total` | Counter | `reason` | Dropped relay attempts |
//! | `rs_outbound_dropped_total` | Counter | `actor_type` | Backpressure drops |
//! | `rs_message_latency_seconds` | Histogram | `message_type` | Request handling time |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
