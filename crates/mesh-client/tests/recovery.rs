//! Tests for connectivity loss and relay outages.
//!
//! Uses tokio's paused clock so grace windows and negotiation timeouts can
//! be crossed without waiting in real time.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::types::ParticipantId;
use mesh_client::actors::MeshEvent;
use mesh_client::session::CloseReason;
use mesh_client::testing::MockBehavior;
use mesh_client::transport::TransportState;
use mesh_client::Config;
use mesh_test_utils::*;
use std::time::Duration;
use tokio::sync::broadcast;

fn peer(id: &str) -> ParticipantId {
    ParticipantId::new(id)
}

async fn transport_connected(member: &TestMember) -> bool {
    member
        .handle
        .get_state()
        .await
        .unwrap()
        .sessions
        .first()
        .is_some_and(|s| s.transport_connected)
}

fn closed_with(event: &MeshEvent, peer_id: &str, reason: CloseReason) -> bool {
    matches!(
        event,
        MeshEvent::SessionClosed { peer_id: p, reason: r } if p.as_str() == peer_id && *r == reason
    )
}

fn drain(events: &mut broadcast::Receiver<MeshEvent>) -> Vec<MeshEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// ============================================================================
// Transport connectivity
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_soft_failure_recovers_within_grace() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let _b = mesh.join("b-2").await;
    eventually(|| transport_connected(&a)).await;

    let mut events = a.subscribe_events();
    let to_b = a.transports.transport_for(&peer("b-2")).unwrap();

    to_b.emit_state(TransportState::Disconnected).await;
    eventually(|| async { a.session_state("b-2").await == Some("disconnected") }).await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(a.session_state("b-2").await, Some("disconnected"));
    assert!(a.connected_peer_ids().await.is_empty());

    to_b.emit_state(TransportState::Connected).await;
    eventually(|| async { a.session_state("b-2").await == Some("connected") }).await;

    // Well past the original grace deadline.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(a.connected_peer_ids().await, ["b-2"]);
    assert_eq!(to_b.close_count(), 0);
    assert_eq!(a.transports.created_count(), 1);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, MeshEvent::SessionClosed { .. })));

    mesh.leave_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_transport_after_connect_gets_grace_period() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let _b = mesh.join("b-2").await;
    eventually(|| transport_connected(&a)).await;

    let to_b = a.transports.transport_for(&peer("b-2")).unwrap();
    to_b.emit_state(TransportState::Failed).await;
    eventually(|| async { a.session_state("b-2").await == Some("disconnected") }).await;

    to_b.emit_state(TransportState::Connected).await;
    eventually(|| async { a.session_state("b-2").await == Some("connected") }).await;
    assert_eq!(to_b.close_count(), 0);

    mesh.leave_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_past_grace_closes_session() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let _b = mesh.join("b-2").await;
    eventually(|| transport_connected(&a)).await;

    let mut events = a.subscribe_events();
    let to_b = a.transports.transport_for(&peer("b-2")).unwrap();
    to_b.emit_state(TransportState::Disconnected).await;

    tokio::time::sleep(Duration::from_secs(6)).await;
    wait_for_event(&mut events, |e| {
        closed_with(e, "b-2", CloseReason::DisconnectTimeout)
    })
    .await;
    assert!(a.session_peer_ids().await.is_empty());
    assert_eq!(to_b.close_count(), 1);

    mesh.leave_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_late_event_from_replaced_transport_is_ignored() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let b = mesh.join("b-2").await;
    eventually(|| transport_connected(&a)).await;
    let old = a.transports.transport_for(&peer("b-2")).unwrap();

    b.handle.leave().await.unwrap();
    mesh.wait_stopped("b-2").await;
    eventually(|| async { a.session_peer_ids().await.is_empty() }).await;
    let _b = mesh.join("b-2").await;
    eventually(|| transport_connected(&a)).await;

    old.emit_state(TransportState::Closed).await;
    old.emit_state(TransportState::Disconnected).await;
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(a.connected_peer_ids().await, ["b-2"]);
    let current = a.transports.transport_for(&peer("b-2")).unwrap();
    assert_eq!(current.close_count(), 0);

    mesh.leave_all().await;
}

// ============================================================================
// Negotiation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_negotiation_without_connectivity_times_out() {
    let behavior = MockBehavior {
        auto_connect: false,
        emit_candidates: 1,
        ..MockBehavior::default()
    };
    let mut mesh = MeshHarness::new().with_behavior(behavior);
    let a = mesh.join("a-1").await;
    let mut a_events = a.subscribe_events();
    let b = mesh.join("b-2").await;
    let mut b_events = b.subscribe_events();

    eventually(|| async { a.session_peer_ids().await == ["b-2"] }).await;
    tokio::time::sleep(Duration::from_secs(11)).await;

    wait_for_event(&mut a_events, |e| {
        closed_with(e, "b-2", CloseReason::NegotiationFailed)
    })
    .await;
    wait_for_event(&mut b_events, |e| {
        closed_with(e, "a-1", CloseReason::NegotiationFailed)
    })
    .await;
    assert!(a.session_peer_ids().await.is_empty());
    assert!(b.session_peer_ids().await.is_empty());

    mesh.leave_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_stalled_transport_fails_negotiation() {
    let behavior = MockBehavior {
        stall_negotiation: true,
        ..MockBehavior::connected()
    };
    let mut mesh = MeshHarness::new().with_behavior(behavior);
    let a = mesh.join("a-1").await;
    let mut events = a.subscribe_events();
    let _b = mesh.join("b-2").await;

    tokio::time::sleep(Duration::from_secs(3)).await;
    wait_for_event(&mut events, |e| {
        closed_with(e, "b-2", CloseReason::NegotiationFailed)
    })
    .await;
    assert!(a.session_peer_ids().await.is_empty());
    assert_eq!(
        a.transports.transport_for(&peer("b-2")).unwrap().close_count(),
        1
    );

    mesh.leave_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_stalled_peer_does_not_hold_up_the_mesh() {
    let config = Config {
        transport_op_timeout: Duration::from_secs(30),
        ..test_config()
    };
    let stalled = MockBehavior {
        stall_negotiation: true,
        ..MockBehavior::connected()
    };
    let mut mesh = MeshHarness::new().with_config(config).with_behavior(stalled);
    let a = mesh.join("a-1").await;
    let _b = mesh.join("b-2").await;
    eventually(|| async { a.transports.transport_for(&peer("b-2")).is_some() }).await;

    // Only the a-1/b-2 pair stays wedged from here on.
    mesh.set_behavior(MockBehavior::connected());
    a.transports.set_behavior(MockBehavior::connected());
    let started = tokio::time::Instant::now();
    let c = mesh.join("c-3").await;
    eventually(|| async { c.connected_peer_ids().await == ["a-1"] }).await;
    assert!(started.elapsed() < Duration::from_secs(1));

    let asked = tokio::time::Instant::now();
    let state = a.handle.get_state().await.unwrap();
    assert!(asked.elapsed() < Duration::from_millis(100));
    assert_eq!(state.sessions.len(), 2);
    assert_eq!(a.connected_peer_ids().await, ["c-3"]);

    mesh.leave_all().await;
}

#[tokio::test]
async fn test_transport_allocation_failure_reports_session_failed() {
    let behavior = MockBehavior {
        fail_create: true,
        ..MockBehavior::connected()
    };
    let mut mesh = MeshHarness::new().with_behavior(behavior);
    let a = mesh.join("a-1").await;
    let mut events = a.subscribe_events();
    let _b = mesh.join("b-2").await;

    wait_for_event(&mut events, |e| {
        matches!(e, MeshEvent::SessionFailed { peer_id, .. } if peer_id.as_str() == "b-2")
    })
    .await;
    assert!(a.session_peer_ids().await.is_empty());

    mesh.leave_all().await;
}

// ============================================================================
// Relay outages
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_presence_outage_within_grace_keeps_sessions() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let b = mesh.join("b-2").await;
    eventually(|| transport_connected(&a)).await;

    let mut events = a.subscribe_events();
    mesh.relay.fail_presence_feeds("relay restart");
    wait_for_event(&mut events, |e| matches!(e, MeshEvent::PresenceDegraded(_))).await;
    assert!(a.handle.get_state().await.unwrap().presence_degraded);

    tokio::time::sleep(Duration::from_secs(5)).await;
    a.handle.resubscribe_presence().await.unwrap();
    b.handle.resubscribe_presence().await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, MeshEvent::PresenceRestored)).await;

    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(b.connected_peer_ids().await, ["a-1"]);
    assert_eq!(a.connected_peer_ids().await, ["b-2"]);
    assert_eq!(a.transports.created_count(), 1);
    assert!(!a.handle.get_state().await.unwrap().presence_degraded);

    mesh.leave_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_presence_outage_past_grace_drops_sessions_until_resubscribe() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let b = mesh.join("b-2").await;
    eventually(|| transport_connected(&a)).await;

    let mut events = a.subscribe_events();
    mesh.relay.fail_presence_feeds("relay restart");
    wait_for_event(&mut events, |e| matches!(e, MeshEvent::PresenceDegraded(_))).await;

    tokio::time::sleep(Duration::from_secs(16)).await;
    wait_for_event(&mut events, |e| {
        closed_with(e, "b-2", CloseReason::PresenceLost)
    })
    .await;
    assert!(a.session_peer_ids().await.is_empty());
    eventually(|| async { b.session_peer_ids().await.is_empty() }).await;

    a.handle.resubscribe_presence().await.unwrap();
    b.handle.resubscribe_presence().await.unwrap();
    wait_for_event(&mut events, |e| matches!(e, MeshEvent::PresenceRestored)).await;

    eventually(|| async { a.connected_peer_ids().await == ["b-2"] }).await;
    eventually(|| async { b.connected_peer_ids().await == ["a-1"] }).await;
    assert_eq!(a.transports.transports_for(&peer("b-2")).len(), 2);

    mesh.leave_all().await;
}

#[tokio::test]
async fn test_signal_feed_failure_is_restored_by_resubscribe() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let mut events = a.subscribe_events();

    mesh.relay.fail_signal_feeds("relay restart");
    wait_for_event(&mut events, |e| matches!(e, MeshEvent::SignalingDegraded(_))).await;
    assert!(a.handle.get_state().await.unwrap().signaling_degraded);

    a.handle.resubscribe_presence().await.unwrap();
    assert!(!a.handle.get_state().await.unwrap().signaling_degraded);

    // Answers from a new peer reach the restored feed.
    let _c = mesh.join("c-3").await;
    eventually(|| async { a.connected_peer_ids().await == ["c-3"] }).await;

    mesh.leave_all().await;
}
