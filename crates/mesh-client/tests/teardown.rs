//! Tests for leaving a room.
//!
//! Verifies:
//! - Sessions are released before the departure is announced
//! - Leave is idempotent
//! - A failed departure announcement still releases every session
//! - A negotiation stuck in the transport does not hold up leave
//! - Cancellation runs the same teardown as leave

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::types::ParticipantId;
use mesh_client::media::TrackKind;
use mesh_client::testing::{MockBehavior, RelayOp};
use mesh_client::{Config, MeshError};
use mesh_test_utils::*;
use std::time::Duration;

fn peer(id: &str) -> ParticipantId {
    ParticipantId::new(id)
}

fn departures(mesh: &MeshHarness, id: &str) -> usize {
    mesh.relay
        .log()
        .iter()
        .filter(|op| {
            matches!(
                op,
                RelayOp::UpsertPresence { participant_id, active: false } if participant_id.as_str() == id
            )
        })
        .count()
}

#[tokio::test]
async fn test_leave_releases_sessions_before_announcing_departure() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let _b = mesh.join("b-2").await;
    let _c = mesh.join("c-3").await;
    eventually(|| async { a.connected_peer_ids().await.len() == 2 }).await;

    a.handle.leave().await.unwrap();
    mesh.wait_stopped("a-1").await;

    let departure = mesh
        .journal
        .position("relay:upsert_presence:a-1:inactive")
        .unwrap();
    let close_b = mesh.journal.position("transport:close:b-2").unwrap();
    let close_c = mesh.journal.position("transport:close:c-3").unwrap();
    assert!(close_b < departure);
    assert!(close_c < departure);

    for id in ["b-2", "c-3"] {
        let transport = a.transports.transport_for(&peer(id)).unwrap();
        assert_eq!(transport.close_count(), 1);
    }
    assert!(!mesh.relay.presence(&peer("a-1")).unwrap().active);

    mesh.leave_all().await;
}

#[tokio::test]
async fn test_leave_twice_announces_departure_once() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let _b = mesh.join("b-2").await;
    eventually(|| async { a.connected_peer_ids().await == ["b-2"] }).await;

    a.handle.leave().await.unwrap();
    a.handle.leave().await.unwrap();
    mesh.wait_stopped("a-1").await;
    a.handle.leave().await.unwrap();

    assert_eq!(departures(&mesh, "a-1"), 1);
    let to_b = a.transports.transport_for(&peer("b-2")).unwrap();
    assert_eq!(to_b.close_count(), 1);

    mesh.leave_all().await;
}

#[tokio::test]
async fn test_failed_departure_still_releases_sessions() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let _b = mesh.join("b-2").await;
    eventually(|| async { a.connected_peer_ids().await == ["b-2"] }).await;

    mesh.relay.set_fail_departures(true);
    a.handle.leave().await.unwrap();
    mesh.wait_stopped("a-1").await;

    let to_b = a.transports.transport_for(&peer("b-2")).unwrap();
    assert_eq!(to_b.close_count(), 1);
    assert!(mesh.journal.position("transport:close:b-2").is_some());
    assert!(mesh
        .journal
        .position("relay:upsert_presence:a-1:inactive")
        .is_none());
    assert!(mesh.relay.presence(&peer("a-1")).unwrap().active);

    mesh.relay.set_fail_departures(false);
    mesh.leave_all().await;
}

#[tokio::test]
async fn test_stalled_relay_does_not_hold_up_leave() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let _b = mesh.join("b-2").await;
    eventually(|| async { a.connected_peer_ids().await == ["b-2"] }).await;

    mesh.relay.set_stall_inserts(true);
    assert!(a.media.remove_track("camera"));
    tokio::time::sleep(Duration::from_millis(20)).await;

    tokio::time::timeout(Duration::from_secs(1), a.handle.leave())
        .await
        .expect("leave should not wait on stalled sends")
        .unwrap();
    mesh.wait_stopped("a-1").await;
    assert_eq!(departures(&mesh, "a-1"), 1);

    mesh.relay.set_stall_inserts(false);
    mesh.leave_all().await;
}

#[tokio::test(start_paused = true)]
async fn test_leave_during_stalled_negotiation_releases_session() {
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

    let started = tokio::time::Instant::now();
    a.handle.leave().await.unwrap();
    mesh.wait_stopped("a-1").await;
    assert!(started.elapsed() < Duration::from_secs(1));

    let to_b = a.transports.transport_for(&peer("b-2")).unwrap();
    assert_eq!(to_b.close_count(), 1);
    assert_eq!(departures(&mesh, "a-1"), 1);

    mesh.leave_all().await;
}

#[tokio::test]
async fn test_cancellation_runs_teardown() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let b = mesh.join("b-2").await;
    eventually(|| async { a.connected_peer_ids().await == ["b-2"] }).await;

    a.handle.cancel();
    mesh.wait_stopped("a-1").await;
    assert!(a.handle.is_cancelled());

    assert_eq!(departures(&mesh, "a-1"), 1);
    let to_b = a.transports.transport_for(&peer("b-2")).unwrap();
    assert_eq!(to_b.close_count(), 1);
    eventually(|| async { b.session_peer_ids().await.is_empty() }).await;

    mesh.leave_all().await;
}

#[tokio::test]
async fn test_requests_after_leave_are_rejected() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;

    a.handle.leave().await.unwrap();
    mesh.wait_stopped("a-1").await;

    assert!(matches!(a.handle.get_state().await, Err(MeshError::Closed)));
    assert!(matches!(
        a.handle.list_connected_peers().await,
        Err(MeshError::Closed)
    ));
    assert!(matches!(
        a.handle.set_track_enabled(TrackKind::Audio, false).await,
        Err(MeshError::Closed)
    ));
    assert!(matches!(
        a.handle.resubscribe_presence().await,
        Err(MeshError::Closed)
    ));
}

#[tokio::test]
async fn test_peer_leaving_does_not_disturb_others() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let b = mesh.join("b-2").await;
    let _c = mesh.join("c-3").await;
    eventually(|| async { b.connected_peer_ids().await.len() == 2 }).await;

    a.handle.leave().await.unwrap();
    mesh.wait_stopped("a-1").await;

    eventually(|| async { b.connected_peer_ids().await == ["c-3"] }).await;
    let b_to_c = b.transports.transport_for(&peer("c-3")).unwrap();
    assert_eq!(b_to_c.close_count(), 0);
    assert!(mesh.is_running("b-2"));
    assert!(mesh.is_running("c-3"));

    mesh.leave_all().await;
}
