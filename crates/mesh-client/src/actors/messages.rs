//! Message types for actor communication.
//!
//! Handles talk to the coordinator over `tokio::sync::mpsc`; request-reply
//! commands carry a `tokio::sync::oneshot` sender.

use crate::errors::MeshError;
use crate::media::{RemoteStream, TrackKind};
use crate::session::CloseReason;
use common::types::{ParticipantId, RoomId};
use tokio::sync::oneshot;

/// Messages sent to the `MeshCoordinator`.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// Connected peers for the presentation layer.
    ListConnectedPeers {
        respond_to: oneshot::Sender<Vec<PeerView>>,
    },

    /// Snapshot of mesh state (for debugging/health).
    GetState {
        respond_to: oneshot::Sender<MeshSnapshot>,
    },

    /// Enable or disable local tracks of one kind on every session.
    SetTrackEnabled {
        kind: TrackKind,
        enabled: bool,
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },

    /// Re-open failed relay subscriptions and reconcile presence.
    ResubscribePresence {
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },

    /// Leave the room: tear down every session and announce departure.
    Leave {
        respond_to: oneshot::Sender<Result<(), MeshError>>,
    },
}

/// Read-only projection of one connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerView {
    pub peer_id: ParticipantId,
    /// Presence display name, or the participant id until the presence
    /// record has arrived.
    pub display_name: String,
    pub remote_stream: Option<RemoteStream>,
}

/// Per-session summary inside a [`MeshSnapshot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub peer_id: ParticipantId,
    pub state: &'static str,
    pub is_initiator: bool,
    pub generation: u64,
    pub transport_connected: bool,
}

/// Mesh state snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSnapshot {
    pub room_id: RoomId,
    pub local_participant_id: ParticipantId,
    /// Ordered by peer id.
    pub sessions: Vec<SessionSummary>,
    pub presence_degraded: bool,
    pub signaling_degraded: bool,
    pub is_leaving: bool,
}

/// Notifications broadcast to `MeshCoordinatorHandle::subscribe_events`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// A session reached `Connected` (first time or after recovery).
    PeerConnected(ParticipantId),
    /// A session closed and was removed.
    SessionClosed {
        peer_id: ParticipantId,
        reason: CloseReason,
    },
    /// A session could not be created for a join or offer.
    SessionFailed {
        peer_id: ParticipantId,
        error: String,
    },
    /// The presence feed failed.
    PresenceDegraded(String),
    /// Presence was re-subscribed and reconciled.
    PresenceRestored,
    /// The inbound signal feed failed.
    SignalingDegraded(String),
}
