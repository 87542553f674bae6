//! Peer session state machine.
//!
//! One session per remote participant, owned by the coordinator. A session
//! drives its transport and returns the signals it produced; it never talks
//! to the relay itself.
//!
//! ```text
//! New -> Offering -> Connected -> Disconnected -> Closed
//!    \-> Answering -/         \-----------------/
//! ```
//!
//! Remote candidates that arrive before a remote description has been
//! applied are buffered and flushed, in arrival order, right after it is.

use crate::errors::MeshError;
use crate::media::{track_set_changed, LocalTrack, RemoteStream, RemoteTrack, TrackKind};
use crate::observability::metrics;
use crate::signaling::message::{IceCandidate, SessionDescription, Signal};
use crate::transport::{PeerTransport, TransportState};
use common::types::ParticipantId;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer left the room.
    PeerLeft,
    /// The local participant left.
    LocalLeave,
    /// Negotiation errored or never reached connectivity.
    NegotiationFailed,
    /// Disconnected longer than the grace window.
    DisconnectTimeout,
    /// The transport closed on its own.
    TransportClosed,
    /// Presence stayed degraded longer than its grace window.
    PresenceLost,
}

impl CloseReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerLeft => "peer_left",
            CloseReason::LocalLeave => "local_leave",
            CloseReason::NegotiationFailed => "negotiation_failed",
            CloseReason::DisconnectTimeout => "disconnect_timeout",
            CloseReason::TransportClosed => "transport_closed",
            CloseReason::PresenceLost => "presence_lost",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Offering {
        awaiting_answer: bool,
        offered_at: Instant,
    },
    Answering,
    Connected,
    Disconnected {
        since: Instant,
    },
    Closed {
        reason: CloseReason,
    },
}

impl SessionState {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::New => "new",
            SessionState::Offering { .. } => "offering",
            SessionState::Answering => "answering",
            SessionState::Connected => "connected",
            SessionState::Disconnected { .. } => "disconnected",
            SessionState::Closed { .. } => "closed",
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed { .. })
    }
}

/// A signal a session wants delivered to its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: ParticipantId,
    pub signal: Signal,
}

/// Run a transport call bounded by `op_timeout`.
async fn bounded<T>(
    op_timeout: Duration,
    op: &'static str,
    fut: impl Future<Output = Result<T, MeshError>>,
) -> Result<T, MeshError> {
    match tokio::time::timeout(op_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(MeshError::Transport(format!(
            "{op} timed out after {}ms",
            op_timeout.as_millis()
        ))),
    }
}

/// One negotiated media session with one remote participant.
pub struct PeerSession {
    peer_id: ParticipantId,
    generation: u64,
    is_initiator: bool,
    state: SessionState,
    transport: Box<dyn PeerTransport>,
    released: bool,
    op_timeout: Duration,
    created_at: Instant,
    transport_connected_at: Option<Instant>,

    local_tracks_attached: Vec<LocalTrack>,
    remote_stream: Option<RemoteStream>,

    remote_description_set: bool,
    pending_remote_candidates: Vec<IceCandidate>,
    seen_candidates: HashSet<IceCandidate>,
    /// Every remote description applied so far. The relay may redeliver
    /// any of them, not just the latest.
    applied_offers: HashSet<String>,
    applied_answers: HashSet<String>,
    /// A local offer is outstanding.
    pending_local_offer: bool,
    /// The track set changed while an offer could not be sent yet.
    needs_renegotiation: bool,
}

impl PeerSession {
    /// Create a session in `New`. Nothing is attached until [`open`](Self::open).
    #[must_use]
    pub fn new(
        peer_id: ParticipantId,
        generation: u64,
        is_initiator: bool,
        transport: Box<dyn PeerTransport>,
        tracks: &[LocalTrack],
        op_timeout: Duration,
    ) -> Self {
        Self {
            peer_id,
            generation,
            is_initiator,
            state: SessionState::New,
            transport,
            released: false,
            op_timeout,
            created_at: Instant::now(),
            transport_connected_at: None,
            local_tracks_attached: tracks.to_vec(),
            remote_stream: None,
            remote_description_set: false,
            pending_remote_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
            applied_offers: HashSet::new(),
            applied_answers: HashSet::new(),
            pending_local_offer: false,
            needs_renegotiation: false,
        }
    }

    /// Attach the local tracks given at construction.
    ///
    /// # Errors
    ///
    /// Returns the transport error if attaching fails; the transport is
    /// closed before returning.
    pub async fn open(&mut self) -> Result<(), MeshError> {
        let tracks = self.local_tracks_attached.clone();
        if let Err(e) = bounded(self.op_timeout, "attach_tracks", self.transport.attach_tracks(&tracks)).await {
            self.release().await;
            return Err(e);
        }

        debug!(
            target: "mesh.session",
            peer_id = %self.peer_id,
            generation = self.generation,
            is_initiator = self.is_initiator,
            tracks = tracks.len(),
            "Session opened"
        );
        Ok(())
    }

    #[must_use]
    pub fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[must_use]
    pub fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    #[must_use]
    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    #[must_use]
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_remote_candidates.len()
    }

    #[must_use]
    pub fn transport_connected(&self) -> bool {
        self.transport_connected_at.is_some()
    }

    /// Begin negotiation as the designated initiator.
    pub async fn start_offer(&mut self, now: Instant) -> Vec<Outbound> {
        if !self.is_initiator || self.state != SessionState::New {
            debug!(
                target: "mesh.session",
                peer_id = %self.peer_id,
                state = self.state.name(),
                "Offer not started"
            );
            return Vec::new();
        }

        self.state = SessionState::Offering {
            awaiting_answer: false,
            offered_at: now,
        };
        self.send_offer(now).await
    }

    /// Apply one inbound signal.
    pub async fn handle_signal(&mut self, signal: Signal, now: Instant) -> Vec<Outbound> {
        if self.is_closed() {
            debug!(
                target: "mesh.session",
                peer_id = %self.peer_id,
                kind = %signal.kind(),
                "Signal for closed session dropped"
            );
            metrics::record_signal_dropped("stale");
            return Vec::new();
        }

        match signal {
            Signal::Offer(description) => self.on_offer(description).await,
            Signal::Answer(description) => self.on_answer(description, now).await,
            Signal::Candidate(candidate) => {
                self.on_remote_candidate(candidate).await;
                Vec::new()
            }
        }
    }

    async fn on_offer(&mut self, description: SessionDescription) -> Vec<Outbound> {
        if self.is_initiator {
            // Impossible for a peer applying the same ordering rule.
            warn!(
                target: "mesh.session",
                peer_id = %self.peer_id,
                "Offer received by designated initiator, ignoring"
            );
            metrics::record_signal_dropped("unexpected");
            return Vec::new();
        }

        if self.applied_offers.contains(&description.sdp) {
            debug!(target: "mesh.session", peer_id = %self.peer_id, "Duplicate offer dropped");
            metrics::record_signal_dropped("duplicate");
            return Vec::new();
        }

        let renegotiating = match self.state {
            SessionState::New => {
                self.state = SessionState::Answering;
                false
            }
            SessionState::Connected | SessionState::Disconnected { .. } => true,
            SessionState::Answering
            | SessionState::Offering { .. }
            | SessionState::Closed { .. } => {
                metrics::record_signal_dropped("unexpected");
                return Vec::new();
            }
        };

        if let Err(e) = bounded(
            self.op_timeout,
            "set_remote_description",
            self.transport.set_remote_description(&description),
        )
        .await
        {
            self.fail(&e).await;
            return Vec::new();
        }
        self.applied_offers.insert(description.sdp);
        self.remote_description_set = true;
        self.flush_candidates().await;

        let answer = match bounded(self.op_timeout, "create_answer", self.transport.create_answer()).await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail(&e).await;
                return Vec::new();
            }
        };

        if self.state == SessionState::Answering {
            self.state = SessionState::Connected;
        }

        info!(
            target: "mesh.session",
            peer_id = %self.peer_id,
            renegotiating,
            "Answered offer"
        );
        vec![Outbound {
            to: self.peer_id.clone(),
            signal: Signal::Answer(answer),
        }]
    }

    async fn on_answer(&mut self, description: SessionDescription, now: Instant) -> Vec<Outbound> {
        if self.applied_answers.contains(&description.sdp) {
            debug!(target: "mesh.session", peer_id = %self.peer_id, "Duplicate answer dropped");
            metrics::record_signal_dropped("duplicate");
            return Vec::new();
        }

        if !self.is_initiator || !self.pending_local_offer {
            debug!(
                target: "mesh.session",
                peer_id = %self.peer_id,
                state = self.state.name(),
                "Answer without outstanding offer dropped"
            );
            metrics::record_signal_dropped("unexpected");
            return Vec::new();
        }

        if let Err(e) = bounded(
            self.op_timeout,
            "set_remote_description",
            self.transport.set_remote_description(&description),
        )
        .await
        {
            self.fail(&e).await;
            return Vec::new();
        }
        self.pending_local_offer = false;
        self.applied_answers.insert(description.sdp);
        self.remote_description_set = true;
        self.flush_candidates().await;

        if let SessionState::Offering { offered_at, .. } = self.state {
            self.state = SessionState::Connected;
            info!(
                target: "mesh.session",
                peer_id = %self.peer_id,
                answer_after_ms = now.saturating_duration_since(offered_at).as_millis(),
                "Answer applied"
            );
        }

        if self.needs_renegotiation && self.state == SessionState::Connected {
            self.needs_renegotiation = false;
            return self.send_offer(now).await;
        }
        Vec::new()
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if !self.seen_candidates.insert(candidate.clone()) {
            debug!(target: "mesh.session", peer_id = %self.peer_id, "Duplicate candidate dropped");
            metrics::record_signal_dropped("duplicate");
            return;
        }

        if self.remote_description_set {
            self.apply_candidate(&candidate).await;
        } else {
            self.pending_remote_candidates.push(candidate);
            debug!(
                target: "mesh.session",
                peer_id = %self.peer_id,
                buffered = self.pending_remote_candidates.len(),
                "Candidate buffered until remote description"
            );
        }
    }

    async fn flush_candidates(&mut self) {
        let pending = std::mem::take(&mut self.pending_remote_candidates);
        if !pending.is_empty() {
            debug!(
                target: "mesh.session",
                peer_id = %self.peer_id,
                count = pending.len(),
                "Flushing buffered candidates"
            );
        }
        for candidate in &pending {
            self.apply_candidate(candidate).await;
        }
    }

    async fn apply_candidate(&mut self, candidate: &IceCandidate) {
        // A rejected candidate only loses one path.
        if let Err(e) = bounded(
            self.op_timeout,
            "add_remote_candidate",
            self.transport.add_remote_candidate(candidate),
        )
        .await
        {
            warn!(
                target: "mesh.session",
                peer_id = %self.peer_id,
                error = %e,
                "Remote candidate rejected"
            );
        }
    }

    async fn send_offer(&mut self, now: Instant) -> Vec<Outbound> {
        let offer = match bounded(self.op_timeout, "create_offer", self.transport.create_offer()).await {
            Ok(offer) => offer,
            Err(e) => {
                self.fail(&e).await;
                return Vec::new();
            }
        };

        self.pending_local_offer = true;
        if let SessionState::Offering { .. } = self.state {
            self.state = SessionState::Offering {
                awaiting_answer: true,
                offered_at: now,
            };
        }

        info!(target: "mesh.session", peer_id = %self.peer_id, "Offer created");
        vec![Outbound {
            to: self.peer_id.clone(),
            signal: Signal::Offer(offer),
        }]
    }

    /// React to a transport connectivity change.
    pub async fn on_transport_state(
        &mut self,
        transport_state: TransportState,
        now: Instant,
    ) -> Vec<Outbound> {
        if self.is_closed() {
            return Vec::new();
        }

        match (transport_state, self.state) {
            (TransportState::Connected, state) => {
                if self.transport_connected_at.is_none() {
                    self.transport_connected_at = Some(now);
                    metrics::record_negotiation_duration(
                        now.saturating_duration_since(self.created_at),
                    );
                    info!(target: "mesh.session", peer_id = %self.peer_id, "Transport connected");
                }

                if let SessionState::Disconnected { since } = state {
                    self.state = SessionState::Connected;
                    info!(
                        target: "mesh.session",
                        peer_id = %self.peer_id,
                        outage_ms = now.saturating_duration_since(since).as_millis(),
                        "Transport recovered"
                    );

                    if self.is_initiator && self.needs_renegotiation && !self.pending_local_offer {
                        self.needs_renegotiation = false;
                        return self.send_offer(now).await;
                    }
                }
            }
            (TransportState::Disconnected | TransportState::Failed, SessionState::Connected) => {
                self.state = SessionState::Disconnected { since: now };
                info!(
                    target: "mesh.session",
                    peer_id = %self.peer_id,
                    transport_state = %transport_state,
                    "Transport lost, waiting for recovery"
                );
            }
            (
                TransportState::Failed,
                SessionState::New | SessionState::Offering { .. } | SessionState::Answering,
            ) => {
                let e = MeshError::NegotiationFailed("transport failed".to_string());
                self.fail(&e).await;
            }
            (TransportState::Closed, _) => {
                self.close(CloseReason::TransportClosed).await;
            }
            _ => {
                debug!(
                    target: "mesh.session",
                    peer_id = %self.peer_id,
                    transport_state = %transport_state,
                    state = self.state.name(),
                    "Transport state noted"
                );
            }
        }
        Vec::new()
    }

    /// Record a track the peer started sending.
    pub fn on_remote_track(&mut self, track: RemoteTrack) {
        if self.is_closed() {
            return;
        }
        debug!(
            target: "mesh.session",
            peer_id = %self.peer_id,
            kind = %track.kind,
            "Remote track added"
        );
        self.remote_stream
            .get_or_insert_with(|| RemoteStream {
                stream_id: track.stream_id.clone(),
                tracks: Vec::new(),
            })
            .upsert(track);
    }

    /// Wrap a locally gathered candidate for the peer.
    #[must_use]
    pub fn on_local_candidate(&self, candidate: IceCandidate) -> Option<Outbound> {
        if self.is_closed() {
            return None;
        }
        Some(Outbound {
            to: self.peer_id.clone(),
            signal: Signal::Candidate(candidate),
        })
    }

    /// Enable or disable local tracks of `kind` without signaling.
    pub async fn set_track_enabled(&mut self, kind: TrackKind, enabled: bool) {
        if self.is_closed() {
            return;
        }

        for track in self.local_tracks_attached.iter_mut().filter(|t| t.kind == kind) {
            track.enabled = enabled;
        }

        if let Err(e) = bounded(
            self.op_timeout,
            "set_track_enabled",
            self.transport.set_track_enabled(kind, enabled),
        )
        .await
        {
            warn!(
                target: "mesh.session",
                peer_id = %self.peer_id,
                kind = %kind,
                error = %e,
                "Failed to toggle track"
            );
        }
    }

    /// Apply a new local track list.
    ///
    /// Enabled-flag changes are control signals on the existing transport.
    /// A changed track set is re-attached; the initiator then renegotiates
    /// with a fresh offer, the other side waits for it.
    pub async fn update_tracks(&mut self, tracks: &[LocalTrack], now: Instant) -> Vec<Outbound> {
        if self.is_closed() {
            return Vec::new();
        }

        if !track_set_changed(&self.local_tracks_attached, tracks) {
            let mut toggles: Vec<(TrackKind, bool)> = Vec::new();
            for track in tracks {
                let before = self.local_tracks_attached.iter().find(|t| t.id == track.id);
                if before.is_some_and(|b| b.enabled != track.enabled)
                    && !toggles.contains(&(track.kind, track.enabled))
                {
                    toggles.push((track.kind, track.enabled));
                }
            }
            for (kind, enabled) in toggles {
                self.set_track_enabled(kind, enabled).await;
            }
            self.local_tracks_attached = tracks.to_vec();
            return Vec::new();
        }

        if let Err(e) = bounded(self.op_timeout, "attach_tracks", self.transport.attach_tracks(tracks)).await {
            warn!(
                target: "mesh.session",
                peer_id = %self.peer_id,
                error = %e,
                "Failed to re-attach tracks"
            );
            return Vec::new();
        }
        self.local_tracks_attached = tracks.to_vec();

        if !self.is_initiator {
            debug!(
                target: "mesh.session",
                peer_id = %self.peer_id,
                "Tracks re-attached, waiting for initiator to renegotiate"
            );
            return Vec::new();
        }

        match self.state {
            SessionState::Connected if !self.pending_local_offer => self.send_offer(now).await,
            SessionState::Connected
            | SessionState::Offering { .. }
            | SessionState::Disconnected { .. } => {
                self.needs_renegotiation = true;
                Vec::new()
            }
            // The first offer will carry the new set.
            SessionState::New | SessionState::Answering | SessionState::Closed { .. } => Vec::new(),
        }
    }

    /// Whether negotiation has exceeded `timeout` without connectivity.
    #[must_use]
    pub fn negotiation_expired(&self, now: Instant, timeout: Duration) -> bool {
        !self.is_closed()
            && self.transport_connected_at.is_none()
            && now.saturating_duration_since(self.created_at) >= timeout
    }

    /// Whether the session has been disconnected for at least `grace`.
    #[must_use]
    pub fn disconnect_expired(&self, now: Instant, grace: Duration) -> bool {
        matches!(self.state, SessionState::Disconnected { since } if now.saturating_duration_since(since) >= grace)
    }

    /// Close the session. Returns `false` if it was already closed.
    pub async fn close(&mut self, reason: CloseReason) -> bool {
        if self.is_closed() {
            return false;
        }

        let previous = self.state.name();
        self.state = SessionState::Closed { reason };
        self.pending_remote_candidates.clear();
        self.release().await;
        metrics::record_session_closed(reason.as_str());

        info!(
            target: "mesh.session",
            peer_id = %self.peer_id,
            generation = self.generation,
            previous,
            reason = reason.as_str(),
            "Session closed"
        );
        true
    }

    async fn fail(&mut self, error: &MeshError) {
        warn!(
            target: "mesh.session",
            peer_id = %self.peer_id,
            state = self.state.name(),
            error = %error,
            "Negotiation failed"
        );
        self.close(CloseReason::NegotiationFailed).await;
    }

    async fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Err(e) = bounded(self.op_timeout, "close", self.transport.close()).await {
            warn!(
                target: "mesh.session",
                peer_id = %self.peer_id,
                error = %e,
                "Transport close failed"
            );
        }
    }
}
