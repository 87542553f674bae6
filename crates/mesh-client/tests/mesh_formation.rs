//! Tests for mesh formation across several participants.
//!
//! Verifies:
//! - Exactly one offer per pair, always from the lower id
//! - Connected peer views carry presence display names and remote streams
//! - A departing peer's session is closed on every other participant
//! - The session limit rejects extra peers

#![allow(clippy::unwrap_used, clippy::expect_used)]

use common::types::ParticipantId;
use mesh_client::actors::MeshEvent;
use mesh_client::session::CloseReason;
use mesh_client::signaling::SignalKind;
use mesh_client::testing::RelayOp;
use mesh_client::{Config, MeshError};
use mesh_test_utils::*;

fn offers(mesh: &MeshHarness, from: &str, to: &str) -> usize {
    mesh.relay
        .messages_between(
            &ParticipantId::new(from),
            &ParticipantId::new(to),
            SignalKind::Offer,
        )
        .len()
}

#[tokio::test]
async fn test_three_participants_form_full_mesh_with_one_offer_per_pair() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let b = mesh.join("b-2").await;
    let c = mesh.join("c-3").await;

    eventually(|| async { a.connected_peer_ids().await == ["b-2", "c-3"] }).await;
    eventually(|| async { b.connected_peer_ids().await == ["a-1", "c-3"] }).await;
    eventually(|| async { c.connected_peer_ids().await == ["a-1", "b-2"] }).await;

    assert_eq!(offers(&mesh, "a-1", "b-2"), 1);
    assert_eq!(offers(&mesh, "a-1", "c-3"), 1);
    assert_eq!(offers(&mesh, "b-2", "c-3"), 1);
    assert_eq!(offers(&mesh, "b-2", "a-1"), 0);
    assert_eq!(offers(&mesh, "c-3", "a-1"), 0);
    assert_eq!(offers(&mesh, "c-3", "b-2"), 0);
    assert_eq!(mesh.relay.count_kind(SignalKind::Answer), 3);

    let state = a.handle.get_state().await.unwrap();
    assert!(state.sessions.iter().all(|s| s.is_initiator));
    let state = c.handle.get_state().await.unwrap();
    assert!(state.sessions.iter().all(|s| !s.is_initiator));

    mesh.leave_all().await;
}

#[tokio::test]
async fn test_join_announces_after_subscribing() {
    let mut mesh = MeshHarness::new();
    let _a = mesh.join("a-1").await;

    let log = mesh.relay.log();
    let subscribe = log
        .iter()
        .position(|op| matches!(op, RelayOp::Subscribe(id) if id.as_str() == "a-1"))
        .unwrap();
    let presence = log
        .iter()
        .position(|op| matches!(op, RelayOp::SubscribePresence))
        .unwrap();
    let announce = log
        .iter()
        .position(|op| matches!(op, RelayOp::UpsertPresence { active: true, .. }))
        .unwrap();
    assert!(subscribe < presence);
    assert!(presence < announce);

    mesh.leave_all().await;
}

#[tokio::test]
async fn test_connected_peer_view_has_display_name_and_stream() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let _b = mesh
        .join_as(TestParticipant::new("b-2").with_name("Bob"))
        .await;

    eventually(|| async {
        a.handle
            .list_connected_peers()
            .await
            .unwrap()
            .first()
            .is_some_and(|p| p.remote_stream.is_some())
    })
    .await;

    let peers = a.handle.list_connected_peers().await.unwrap();
    assert_eq!(peers.len(), 1);
    let bob = peers.first().unwrap();
    assert_eq!(bob.display_name, "Bob");
    let stream = bob.remote_stream.as_ref().unwrap();
    assert_eq!(stream.stream_id, "b-2");
    assert_eq!(stream.tracks.len(), 1);

    mesh.leave_all().await;
}

#[tokio::test]
async fn test_departing_peer_is_removed_everywhere() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let b = mesh.join("b-2").await;
    let c = mesh.join("c-3").await;
    eventually(|| async { a.connected_peer_ids().await.len() == 2 }).await;
    eventually(|| async { c.connected_peer_ids().await.len() == 2 }).await;

    let mut a_events = a.subscribe_events();
    let mut c_events = c.subscribe_events();
    b.handle.leave().await.unwrap();
    mesh.wait_stopped("b-2").await;

    let event = wait_for_event(&mut a_events, |e| {
        matches!(e, MeshEvent::SessionClosed { peer_id, .. } if peer_id.as_str() == "b-2")
    })
    .await;
    assert_eq!(
        event,
        MeshEvent::SessionClosed {
            peer_id: ParticipantId::new("b-2"),
            reason: CloseReason::PeerLeft,
        }
    );
    wait_for_event(&mut c_events, |e| {
        matches!(e, MeshEvent::SessionClosed { peer_id, .. } if peer_id.as_str() == "b-2")
    })
    .await;

    assert_eq!(a.connected_peer_ids().await, ["c-3"]);
    assert_eq!(c.connected_peer_ids().await, ["a-1"]);

    let to_b = a.transports.transport_for(&ParticipantId::new("b-2")).unwrap();
    assert_eq!(to_b.close_count(), 1);
    assert!(!mesh.relay.presence(&ParticipantId::new("b-2")).unwrap().active);

    mesh.leave_all().await;
}

#[tokio::test]
async fn test_rejoining_peer_gets_fresh_session() {
    let mut mesh = MeshHarness::new();
    let a = mesh.join("a-1").await;
    let b = mesh.join("b-2").await;
    eventually(|| async { a.connected_peer_ids().await == ["b-2"] }).await;

    b.handle.leave().await.unwrap();
    mesh.wait_stopped("b-2").await;
    eventually(|| async { a.session_peer_ids().await.is_empty() }).await;

    let _b = mesh.join("b-2").await;
    eventually(|| async { a.connected_peer_ids().await == ["b-2"] }).await;

    let transports = a.transports.transports_for(&ParticipantId::new("b-2"));
    assert_eq!(transports.len(), 2);
    let first = transports.first().unwrap().context().generation;
    let second = transports.last().unwrap().context().generation;
    assert!(second > first);
    assert_eq!(offers(&mesh, "a-1", "b-2"), 2);

    mesh.leave_all().await;
}

#[tokio::test]
async fn test_session_limit_rejects_extra_peers() {
    let config = Config {
        max_peers: 1,
        ..test_config()
    };
    let mut mesh = MeshHarness::new().with_config(config);
    let a = mesh.join("a-1").await;
    let mut events = a.subscribe_events();

    let _b = mesh.join("b-2").await;
    let _c = mesh.join("c-3").await;

    let event = wait_for_event(&mut events, |e| matches!(e, MeshEvent::SessionFailed { .. })).await;
    assert!(matches!(
        event,
        MeshEvent::SessionFailed { ref peer_id, ref error }
            if peer_id.as_str() == "c-3" && error.contains("session limit")
    ));

    eventually(|| async { a.connected_peer_ids().await == ["b-2"] }).await;
    assert_eq!(a.session_peer_ids().await, ["b-2"]);
    assert_eq!(offers(&mesh, "a-1", "c-3"), 0);

    mesh.leave_all().await;
}

#[tokio::test]
async fn test_join_fails_while_relay_is_down() {
    let mut mesh = MeshHarness::new();
    mesh.relay.set_available(false);

    let result = mesh.try_join_as(TestParticipant::new("a-1")).await;
    assert!(matches!(result, Err(MeshError::RelayUnavailable(_))));
    assert!(mesh.relay.presence(&ParticipantId::new("a-1")).is_none());

    mesh.relay.set_available(true);
    let a = mesh.join("a-1").await;
    assert!(a.session_peer_ids().await.is_empty());

    mesh.leave_all().await;
}
