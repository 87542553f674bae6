//! Observability for the mesh client.
//!
//! # Privacy by Default
//!
//! Actor loops use `#[instrument(skip_all)]` with explicit fields. SDP
//! bodies and candidate lines are never logged; participant ids are logged
//! as fields but never used as metric labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `mesh_sessions_active` | Gauge | none | Live peer sessions |
//! | `mesh_sessions_created_total` | Counter | none | Sessions created |
//! | `mesh_sessions_closed_total` | Counter | `reason` | Sessions closed |
//! | `mesh_signals_sent_total` | Counter | `kind`, `status` | Relay inserts |
//! | `mesh_signals_received_total` | Counter | `kind` | Relay deliveries |
//! | `mesh_signals_dropped_total` | Counter | `reason` | Dropped inbound signals |
//! | `mesh_presence_events_total` | Counter | `event` | Presence tracker output |
//! | `mesh_negotiation_duration_seconds` | Histogram | none | Creation to connectivity |
//!
//! Installing a recorder is left to the embedding application.

pub mod metrics;
