//! Metrics definitions for the mesh client.
//!
//! All metrics follow Prometheus naming conventions:
//! - `mesh_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded; peer and room identifiers are never used as labels:
//! - `kind`: 3 values (offer, answer, ice-candidate)
//! - `status`: 2 values (success, error)
//! - `reason`: bounded by `CloseReason` and drop reasons (~8 values)
//! - `event`: 3 values (joined, left, degraded)

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// ============================================================================
// Session Metrics
// ============================================================================

/// Set the number of live peer sessions.
///
/// Metric: `mesh_sessions_active`
/// Labels: none
pub fn set_sessions_active(count: usize) {
    // usize to f64 conversion is safe for realistic session counts
    #[allow(clippy::cast_precision_loss)]
    gauge!("mesh_sessions_active").set(count as f64);
}

/// Record a peer session being created.
///
/// Metric: `mesh_sessions_created_total`
/// Labels: none
pub fn record_session_created() {
    counter!("mesh_sessions_created_total").increment(1);
}

/// Record a peer session reaching `Closed`.
///
/// Metric: `mesh_sessions_closed_total`
/// Labels: `reason`
///
/// Reasons: `peer_left`, `local_leave`, `negotiation_failed`,
/// `disconnect_timeout`, `transport_closed`, `presence_lost`
pub fn record_session_closed(reason: &str) {
    counter!("mesh_sessions_closed_total", "reason" => reason.to_string()).increment(1);
}

/// Record time from session creation to first transport connectivity.
///
/// Metric: `mesh_negotiation_duration_seconds`
/// Labels: none
pub fn record_negotiation_duration(duration: Duration) {
    histogram!("mesh_negotiation_duration_seconds").record(duration.as_secs_f64());
}

// ============================================================================
// Signaling Metrics
// ============================================================================

/// Record a signal handed to the relay.
///
/// Metric: `mesh_signals_sent_total`
/// Labels: `kind`, `status` (success, error)
///
/// Cardinality: 6 (3 kinds x 2 statuses)
pub fn record_signal_sent(kind: &str, status: &str) {
    counter!("mesh_signals_sent_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a signal received from the relay.
///
/// Metric: `mesh_signals_received_total`
/// Labels: `kind`
pub fn record_signal_received(kind: &str) {
    counter!("mesh_signals_received_total", "kind" => kind.to_string()).increment(1);
}

/// Record a dropped inbound signal.
///
/// Metric: `mesh_signals_dropped_total`
/// Labels: `reason` (malformed, stale, duplicate, unexpected)
pub fn record_signal_dropped(reason: &str) {
    counter!("mesh_signals_dropped_total", "reason" => reason.to_string()).increment(1);
}

// ============================================================================
// Presence Metrics
// ============================================================================

/// Record a presence event emitted by the tracker.
///
/// Metric: `mesh_presence_events_total`
/// Labels: `event` (joined, left, degraded)
pub fn record_presence_event(event: &str) {
    counter!("mesh_presence_events_total", "event" => event.to_string()).increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};
    use metrics_util::MetricKind;

    // The metrics crate records to a no-op recorder when none is installed,
    // so these calls only need to not panic.
    #[test]
    fn test_recording_without_recorder_is_noop() {
        set_sessions_active(0);
        set_sessions_active(3);
        record_session_created();
        record_session_closed("peer_left");
        record_negotiation_duration(Duration::from_millis(120));
        record_signal_sent("offer", "success");
        record_signal_received("answer");
        record_signal_dropped("stale");
        record_presence_event("joined");
    }

    #[test]
    fn test_metrics_reach_local_recorder() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_sessions_active(2);
            record_session_created();
            record_session_created();
            record_session_closed("negotiation_failed");
            record_signal_sent("ice-candidate", "error");
            record_presence_event("degraded");
        });

        let snapshot = snapshotter.snapshot().into_vec();

        let created = snapshot.iter().find(|(key, _, _, _)| {
            key.kind() == MetricKind::Counter && key.key().name() == "mesh_sessions_created_total"
        });
        assert!(matches!(created, Some((_, _, _, DebugValue::Counter(2)))));

        let closed = snapshot.iter().find(|(key, _, _, _)| {
            key.key().name() == "mesh_sessions_closed_total"
                && key
                    .key()
                    .labels()
                    .any(|l| l.key() == "reason" && l.value() == "negotiation_failed")
        });
        assert!(closed.is_some());

        let active = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == "mesh_sessions_active");
        assert!(matches!(active, Some((_, _, _, DebugValue::Gauge(v))) if v.into_inner() == 2.0));
    }
}
