//! Peer transport seam.
//!
//! One [`PeerTransport`] is one negotiated media session with one peer (the
//! path-negotiation protocol itself is a black box). Transports report
//! asynchronous happenings on the events channel handed to the factory;
//! every event carries the peer id and session generation it belongs to.

#[cfg(feature = "webrtc")]
pub mod webrtc;

use crate::config::Config;
use crate::errors::MeshError;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::signaling::message::{IceCandidate, SessionDescription};
use async_trait::async_trait;
use common::types::ParticipantId;
use std::fmt;
use tokio::sync::mpsc;

/// Connectivity of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransportState::New => "new",
            TransportState::Connecting => "connecting",
            TransportState::Connected => "connected",
            TransportState::Disconnected => "disconnected",
            TransportState::Failed => "failed",
            TransportState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Identity a transport stamps on its events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportContext {
    pub peer_id: ParticipantId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEventKind {
    /// A local candidate to trickle to the peer.
    LocalCandidate(IceCandidate),
    /// Connectivity changed.
    StateChanged(TransportState),
    /// The peer started sending a track.
    RemoteTrack(RemoteTrack),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    pub peer_id: ParticipantId,
    pub generation: u64,
    pub kind: TransportEventKind,
}

impl TransportEvent {
    #[must_use]
    pub fn new(context: &TransportContext, kind: TransportEventKind) -> Self {
        Self {
            peer_id: context.peer_id.clone(),
            generation: context.generation,
            kind,
        }
    }
}

/// One negotiated media session with one peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach exactly `tracks`, detaching any previously attached track
    /// not in the list.
    async fn attach_tracks(&mut self, tracks: &[LocalTrack]) -> Result<(), MeshError>;

    /// Create an offer and apply it as the local description.
    async fn create_offer(&mut self) -> Result<SessionDescription, MeshError>;

    /// Create an answer to the applied remote offer and apply it as the
    /// local description.
    async fn create_answer(&mut self) -> Result<SessionDescription, MeshError>;

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MeshError>;

    /// Apply a remote candidate. Only valid after a remote description.
    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MeshError>;

    /// Enable or disable every attached track of `kind` without signaling.
    async fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool)
        -> Result<(), MeshError>;

    /// Release all resources.
    async fn close(&mut self) -> Result<(), MeshError>;
}

/// Builds transports for new peer sessions.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        context: TransportContext,
        config: &Config,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, MeshError>;
}
