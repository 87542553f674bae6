//! `MeshCoordinator` - the single owner of one room membership.
//!
//! The coordinator owns the room-level state and serializes it through one
//! task:
//! - presence joins and leaves from the `PresenceTracker`
//! - inbound signals from the relay, routed to the sending peer's actor
//! - local track changes, fanned out to every peer actor
//! - notices from peer actors (connected, closed, failed)
//! - commands from `MeshCoordinatorHandle`s
//! - a periodic presence-grace check
//!
//! Each remote participant gets its own `PeerActor`, which owns the
//! `PeerSession`, its transport and its `Outbox`. The coordinator never
//! waits on a transport, so a stalled peer cannot hold up presence handling,
//! signal routing, handle requests or leaving.
//!
//! # Initiator Rule
//!
//! For every pair, the participant whose id sorts lower sends the offer.
//! Both sides apply the rule independently, so exactly one offer is made per
//! pair and the two sides never race each other into two sessions.
//!
//! An offer from a peer with no session is answered even when the local
//! side sorts lower. The offering peer holds the initiator role in its own
//! session and renegotiates track changes from there, so the local session
//! takes the answering role to match.
//!
//! # Teardown
//!
//! Leaving (or cancelling the token) runs in this order, each step
//! best-effort:
//! 1. Stop taking presence and signal events
//! 2. Close every peer actor, interrupting in-flight transport calls, and
//!    wait for the transports to be released
//! 3. Mark the local participant departed on the relay

use crate::config::Config;
use crate::errors::MeshError;
use crate::media::{LocalMedia, LocalTrack, TrackKind};
use crate::observability::metrics;
use crate::presence::{PresenceEvent, PresenceRecord, PresenceTracker};
use crate::session::{CloseReason, SessionState};
use crate::signaling::{Relay, Signal, SignalStream, SignalingClient, SignalingMessage};
use crate::transport::TransportFactory;

use super::messages::{CoordinatorMessage, MeshEvent, MeshSnapshot, PeerView, SessionSummary};
use super::peer::{PeerActor, PeerActorHandle, PeerCommand, PeerNotice, PeerSetup};

use common::types::{ParticipantId, RoomId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the coordinator mailbox.
const COORDINATOR_CHANNEL_BUFFER: usize = 256;

/// Channel buffer size for notices from all peer actors.
const PEER_NOTICE_BUFFER: usize = 256;

/// Channel buffer size for broadcast `MeshEvent`s.
const MESH_EVENT_BUFFER: usize = 64;

/// Who is joining which room.
#[derive(Debug, Clone)]
pub struct Membership {
    pub room_id: RoomId,
    pub participant_id: ParticipantId,
    pub display_name: String,
}

impl Membership {
    #[must_use]
    pub fn new(
        room_id: RoomId,
        participant_id: ParticipantId,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            room_id,
            participant_id,
            display_name: display_name.into(),
        }
    }
}

/// Whether `local` drives the offer for the pair `(local, peer)`.
#[must_use]
pub fn is_initiator(local: &ParticipantId, peer: &ParticipantId) -> bool {
    local < peer
}

/// Handle to a `MeshCoordinator`.
#[derive(Clone)]
pub struct MeshCoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
    events: broadcast::Sender<MeshEvent>,
    cancel_token: CancellationToken,
    room_id: RoomId,
    local_participant_id: ParticipantId,
}

impl MeshCoordinatorHandle {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn local_participant_id(&self) -> &ParticipantId {
        &self.local_participant_id
    }

    /// Peers whose session is `Connected`, ordered by peer id.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Closed` once the mesh has been torn down.
    pub async fn list_connected_peers(&self) -> Result<Vec<PeerView>, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.request(CoordinatorMessage::ListConnectedPeers { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    /// Current mesh state (for debugging/health).
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Closed` once the mesh has been torn down.
    pub async fn get_state(&self) -> Result<MeshSnapshot, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.request(CoordinatorMessage::GetState { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))
    }

    /// Mute/unmute or camera on/off on every session, without signaling.
    ///
    /// Resolves once every live session has applied the change.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Closed` once the mesh has been torn down.
    pub async fn set_track_enabled(&self, kind: TrackKind, enabled: bool) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.request(CoordinatorMessage::SetTrackEnabled {
            kind,
            enabled,
            respond_to: tx,
        })
        .await?;
        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Re-open failed relay subscriptions and reconcile presence.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::RelayUnavailable` if the relay still refuses,
    /// or `MeshError::Closed` once the mesh has been torn down.
    pub async fn resubscribe_presence(&self) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.request(CoordinatorMessage::ResubscribePresence { respond_to: tx })
            .await?;
        rx.await
            .map_err(|e| MeshError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave the room and wait for teardown to finish.
    ///
    /// # Errors
    ///
    /// None currently; leaving an already torn-down mesh is `Ok`.
    pub async fn leave(&self) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(CoordinatorMessage::Leave { respond_to: tx })
            .await
            .is_err()
        {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Subscribe to mesh notifications.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Cancel the coordinator. Runs the same teardown as [`leave`](Self::leave).
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the coordinator is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn request(&self, message: CoordinatorMessage) -> Result<(), MeshError> {
        self.sender.send(message).await.map_err(|_| MeshError::Closed)
    }
}

/// The `MeshCoordinator` implementation.
pub struct MeshCoordinator {
    config: Config,
    room_id: RoomId,
    local_id: ParticipantId,
    /// Message receiver.
    receiver: mpsc::Receiver<CoordinatorMessage>,
    cancel_token: CancellationToken,
    events: broadcast::Sender<MeshEvent>,

    signaling: SignalingClient,
    /// `None` after the feed failed, until resubscribed.
    signals: Option<SignalStream>,
    presence: PresenceTracker,
    presence_degraded_since: Option<Instant>,
    /// Sessions were closed for prolonged presence degradation.
    presence_sessions_dropped: bool,

    transports: Arc<dyn TransportFactory>,
    notices_tx: mpsc::Sender<PeerNotice>,
    notices_rx: mpsc::Receiver<PeerNotice>,

    media_rx: watch::Receiver<Vec<LocalTrack>>,
    media_open: bool,
    local_tracks: Vec<LocalTrack>,

    /// Live sessions. A session leaves this map as soon as its close is
    /// requested, so a returning peer gets a fresh one.
    sessions: BTreeMap<ParticipantId, PeerActorHandle>,
    /// Every peer actor still running, keyed by generation.
    peer_tasks: HashMap<u64, JoinHandle<()>>,
    next_generation: u64,
    is_leaving: bool,
}

impl MeshCoordinator {
    /// Join the room and spawn the coordinator.
    ///
    /// Subscribes to inbound signals, starts the presence tracker and then
    /// announces the local participant as active, in that order, so nothing
    /// addressed to the local participant is missed.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::RelayUnavailable` if any of the three relay
    /// calls fails.
    pub async fn spawn(
        config: Config,
        membership: Membership,
        relay: Arc<dyn Relay>,
        transports: Arc<dyn TransportFactory>,
        media: Arc<dyn LocalMedia>,
        cancel_token: CancellationToken,
    ) -> Result<(MeshCoordinatorHandle, JoinHandle<()>), MeshError> {
        let Membership {
            room_id,
            participant_id: local_id,
            display_name,
        } = membership;

        let signaling = SignalingClient::new(relay.clone(), room_id.clone(), local_id.clone());
        let signals = signaling.subscribe().await?;
        let presence = PresenceTracker::start(relay, room_id.clone(), local_id.clone()).await?;
        signaling.mark_active(&display_name).await?;

        let (sender, receiver) = mpsc::channel(COORDINATOR_CHANNEL_BUFFER);
        let (notices_tx, notices_rx) = mpsc::channel(PEER_NOTICE_BUFFER);
        let (events, _) = broadcast::channel(MESH_EVENT_BUFFER);

        let mut media_rx = media.subscribe();
        let local_tracks = media_rx.borrow_and_update().clone();

        let actor = Self {
            config,
            room_id: room_id.clone(),
            local_id: local_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            events: events.clone(),
            signaling,
            signals: Some(signals),
            presence,
            presence_degraded_since: None,
            presence_sessions_dropped: false,
            transports,
            notices_tx,
            notices_rx,
            media_rx,
            media_open: true,
            local_tracks,
            sessions: BTreeMap::new(),
            peer_tasks: HashMap::new(),
            next_generation: 1,
            is_leaving: false,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = MeshCoordinatorHandle {
            sender,
            events,
            cancel_token,
            room_id,
            local_participant_id: local_id,
        };

        Ok((handle, task_handle))
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "mesh.actor.coordinator",
        fields(room_id = %self.room_id, participant_id = %self.local_id)
    )]
    async fn run(mut self) {
        info!(
            target: "mesh.actor.coordinator",
            room_id = %self.room_id,
            participant_id = %self.local_id,
            "MeshCoordinator started"
        );

        let mut grace_check = tokio::time::interval(self.config.housekeeping_interval);
        grace_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "mesh.actor.coordinator",
                        room_id = %self.room_id,
                        "MeshCoordinator received cancellation signal"
                    );
                    self.teardown().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message).await,
                        None => {
                            info!(
                                target: "mesh.actor.coordinator",
                                room_id = %self.room_id,
                                "MeshCoordinator channel closed, leaving"
                            );
                            self.teardown().await;
                            break;
                        }
                    }
                }

                event = self.presence.next_event() => {
                    self.handle_presence_event(event);
                }

                inbound = next_signal(&mut self.signals) => {
                    match inbound {
                        Some(Ok(message)) => self.handle_signal(message),
                        Some(Err(e)) => self.signaling_degraded(e.to_string()),
                        None => self.signaling_degraded("signal feed closed".to_string()),
                    }
                }

                Some(notice) = self.notices_rx.recv() => {
                    self.handle_notice(notice);
                }

                changed = self.media_rx.changed(), if self.media_open => {
                    if changed.is_ok() {
                        self.handle_tracks_changed();
                    } else {
                        debug!(target: "mesh.actor.coordinator", "Local media source dropped");
                        self.media_open = false;
                    }
                }

                _ = grace_check.tick() => {
                    self.check_presence_grace(Instant::now());
                }
            }

            if self.is_leaving {
                break;
            }
        }

        info!(
            target: "mesh.actor.coordinator",
            room_id = %self.room_id,
            participant_id = %self.local_id,
            "MeshCoordinator stopped"
        );
    }

    /// Handle a single command.
    async fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::ListConnectedPeers { respond_to } => {
                let _ = respond_to.send(self.connected_peers());
            }

            CoordinatorMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }

            CoordinatorMessage::SetTrackEnabled {
                kind,
                enabled,
                respond_to,
            } => {
                for track in self.local_tracks.iter_mut().filter(|t| t.kind == kind) {
                    track.enabled = enabled;
                }
                let mut applied = Vec::with_capacity(self.sessions.len());
                for session in self.sessions.values() {
                    let (done, applied_rx) = oneshot::channel();
                    session.send(PeerCommand::SetTrackEnabled {
                        kind,
                        enabled,
                        done,
                    });
                    applied.push(applied_rx);
                }
                debug!(
                    target: "mesh.actor.coordinator",
                    kind = %kind,
                    enabled,
                    sessions = self.sessions.len(),
                    "Local track toggled"
                );

                // Reply once every session has applied it, off the loop.
                tokio::spawn(async move {
                    for applied_rx in applied {
                        // A session that closed meanwhile needs nothing.
                        let _ = applied_rx.await;
                    }
                    let _ = respond_to.send(Ok(()));
                });
            }

            CoordinatorMessage::ResubscribePresence { respond_to } => {
                let result = self.resubscribe().await;
                let _ = respond_to.send(result);
            }

            CoordinatorMessage::Leave { respond_to } => {
                self.teardown().await;
                let _ = respond_to.send(Ok(()));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------------

    fn handle_presence_event(&mut self, event: PresenceEvent) {
        match event {
            PresenceEvent::Joined(record) => self.peer_joined(&record),
            PresenceEvent::Left(peer_id) => self.peer_left(&peer_id),
            PresenceEvent::Degraded(reason) => {
                warn!(
                    target: "mesh.actor.coordinator",
                    room_id = %self.room_id,
                    reason = %reason,
                    grace_ms = self.config.presence_degraded_grace.as_millis(),
                    "Presence degraded"
                );
                self.presence_degraded_since = Some(Instant::now());
                self.emit(MeshEvent::PresenceDegraded(reason));
            }
        }
    }

    fn peer_joined(&mut self, record: &PresenceRecord) {
        let peer_id = &record.participant_id;
        if self.sessions.contains_key(peer_id) {
            debug!(
                target: "mesh.actor.coordinator",
                peer_id = %peer_id,
                "Session already exists for joined peer"
            );
            return;
        }

        let initiator = is_initiator(&self.local_id, peer_id);
        info!(
            target: "mesh.actor.coordinator",
            peer_id = %peer_id,
            display_name = %record.display_name,
            initiator,
            "Peer joined"
        );
        self.open_session(peer_id.clone(), initiator);
    }

    fn peer_left(&mut self, peer_id: &ParticipantId) {
        match self.sessions.remove(peer_id) {
            Some(session) => {
                info!(target: "mesh.actor.coordinator", peer_id = %peer_id, "Peer left");
                session.close(CloseReason::PeerLeft);
                metrics::set_sessions_active(self.sessions.len());
            }
            None => {
                debug!(
                    target: "mesh.actor.coordinator",
                    peer_id = %peer_id,
                    "Leave for peer without session"
                );
            }
        }
    }

    async fn resubscribe(&mut self) -> Result<(), MeshError> {
        if self.is_leaving {
            return Err(MeshError::Closed);
        }

        if self.signals.is_none() {
            self.signals = Some(self.signaling.subscribe().await?);
            info!(target: "mesh.actor.coordinator", room_id = %self.room_id, "Signal feed restored");
        }

        self.presence.resubscribe().await?;
        let was_degraded = self.presence_degraded_since.take().is_some();
        self.presence_sessions_dropped = false;
        if was_degraded {
            self.emit(MeshEvent::PresenceRestored);
        }

        // Sessions dropped while degraded belong to peers the tracker still
        // considers present, so reconciliation alone will not re-join them.
        for record in self.presence.list_active() {
            if !self.sessions.contains_key(&record.participant_id) {
                self.peer_joined(&record);
            }
        }
        Ok(())
    }

    /// Close every session once presence has been degraded past its grace
    /// window.
    fn check_presence_grace(&mut self, now: Instant) {
        let Some(since) = self.presence_degraded_since else {
            return;
        };
        let degraded_for = now.saturating_duration_since(since);
        if self.presence_sessions_dropped || degraded_for < self.config.presence_degraded_grace {
            return;
        }

        warn!(
            target: "mesh.actor.coordinator",
            room_id = %self.room_id,
            sessions = self.sessions.len(),
            degraded_ms = degraded_for.as_millis(),
            "Presence degraded past grace period, closing all sessions"
        );
        self.presence_sessions_dropped = true;
        for session in std::mem::take(&mut self.sessions).into_values() {
            session.close(CloseReason::PresenceLost);
        }
        metrics::set_sessions_active(0);
    }

    // ------------------------------------------------------------------------
    // Signaling
    // ------------------------------------------------------------------------

    fn signaling_degraded(&mut self, reason: String) {
        warn!(
            target: "mesh.actor.coordinator",
            room_id = %self.room_id,
            reason = %reason,
            "Signal feed failed"
        );
        self.signals = None;
        self.emit(MeshEvent::SignalingDegraded(reason));
    }

    fn handle_signal(&mut self, message: SignalingMessage) {
        metrics::record_signal_received(message.kind.as_str());
        let peer_id = message.from_peer_id.clone();

        let signal = match Signal::from_message(&message) {
            Ok(signal) => signal,
            Err(e) => {
                warn!(
                    target: "mesh.actor.coordinator",
                    peer_id = %peer_id,
                    kind = %message.kind,
                    error = %e,
                    "Dropping malformed signal"
                );
                metrics::record_signal_dropped("malformed");
                return;
            }
        };

        if peer_id == self.local_id {
            debug!(target: "mesh.actor.coordinator", "Dropping signal from self");
            metrics::record_signal_dropped("unexpected");
            return;
        }

        if !self.sessions.contains_key(&peer_id) {
            if !matches!(signal, Signal::Offer(_)) {
                let e = MeshError::StaleSignal(peer_id.to_string());
                debug!(
                    target: "mesh.actor.coordinator",
                    kind = %signal.kind(),
                    error = %e,
                    "Dropping signal without session"
                );
                metrics::record_signal_dropped("stale");
                return;
            }

            if is_initiator(&self.local_id, &peer_id) {
                warn!(
                    target: "mesh.actor.coordinator",
                    peer_id = %peer_id,
                    "Offer from peer that should be answering, taking the answering role"
                );
            }
            if !self.open_session(peer_id.clone(), false) {
                return;
            }
        }

        if let Some(session) = self.sessions.get(&peer_id) {
            session.send(PeerCommand::Signal(signal));
        }
    }

    // ------------------------------------------------------------------------
    // Media
    // ------------------------------------------------------------------------

    fn handle_tracks_changed(&mut self) {
        let tracks = self.media_rx.borrow_and_update().clone();
        debug!(
            target: "mesh.actor.coordinator",
            tracks = tracks.len(),
            sessions = self.sessions.len(),
            "Local tracks changed"
        );

        for session in self.sessions.values() {
            session.send(PeerCommand::UpdateTracks(tracks.clone()));
        }
        self.local_tracks = tracks;
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Spawn a peer actor. Returns whether a session exists afterwards.
    fn open_session(&mut self, peer_id: ParticipantId, initiator: bool) -> bool {
        match self.try_open_session(peer_id.clone(), initiator) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    target: "mesh.actor.coordinator",
                    peer_id = %peer_id,
                    error = %e,
                    "Failed to create session"
                );
                self.emit(MeshEvent::SessionFailed {
                    peer_id,
                    error: e.to_string(),
                });
                false
            }
        }
    }

    fn try_open_session(
        &mut self,
        peer_id: ParticipantId,
        initiator: bool,
    ) -> Result<(), MeshError> {
        if self.is_leaving {
            return Err(MeshError::Closed);
        }
        if self.sessions.len() >= self.config.max_peers {
            return Err(MeshError::ResourceExhausted(format!(
                "session limit of {} reached",
                self.config.max_peers
            )));
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let (session, task) = PeerActor::spawn(
            PeerSetup {
                peer_id: peer_id.clone(),
                generation,
                is_initiator: initiator,
                tracks: self.local_tracks.clone(),
            },
            self.config.clone(),
            self.transports.clone(),
            self.signaling.clone(),
            self.notices_tx.clone(),
            self.cancel_token.child_token(),
        );

        self.sessions.insert(peer_id, session);
        self.peer_tasks.insert(generation, task);
        metrics::record_session_created();
        metrics::set_sessions_active(self.sessions.len());
        Ok(())
    }

    /// Whether `generation` is the live session for `peer_id`.
    fn is_live(&self, peer_id: &ParticipantId, generation: u64) -> bool {
        self.sessions
            .get(peer_id)
            .is_some_and(|s| s.generation() == generation)
    }

    fn handle_notice(&mut self, notice: PeerNotice) {
        match notice {
            PeerNotice::Connected {
                peer_id,
                generation,
            } => {
                if self.is_live(&peer_id, generation) {
                    info!(target: "mesh.actor.coordinator", peer_id = %peer_id, "Peer connected");
                    self.emit(MeshEvent::PeerConnected(peer_id));
                }
            }

            PeerNotice::Closed {
                peer_id,
                generation,
                reason,
            } => {
                self.peer_tasks.remove(&generation);
                if self.is_live(&peer_id, generation) {
                    self.sessions.remove(&peer_id);
                    metrics::set_sessions_active(self.sessions.len());
                }
                debug!(
                    target: "mesh.actor.coordinator",
                    peer_id = %peer_id,
                    generation,
                    reason = reason.as_str(),
                    "Session removed"
                );
                self.emit(MeshEvent::SessionClosed { peer_id, reason });
            }

            PeerNotice::Failed {
                peer_id,
                generation,
                error,
            } => {
                self.peer_tasks.remove(&generation);
                if self.is_live(&peer_id, generation) {
                    self.sessions.remove(&peer_id);
                    metrics::set_sessions_active(self.sessions.len());
                }
                self.emit(MeshEvent::SessionFailed {
                    peer_id,
                    error: error.to_string(),
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // Views and teardown
    // ------------------------------------------------------------------------

    fn connected_peers(&self) -> Vec<PeerView> {
        self.sessions
            .values()
            .filter_map(|session| {
                let status = session.status();
                (status.state == SessionState::Connected).then(|| PeerView {
                    peer_id: session.peer_id().clone(),
                    display_name: self
                        .presence
                        .display_name(session.peer_id())
                        .unwrap_or_else(|| session.peer_id().as_str())
                        .to_string(),
                    remote_stream: status.remote_stream,
                })
            })
            .collect()
    }

    fn snapshot(&self) -> MeshSnapshot {
        MeshSnapshot {
            room_id: self.room_id.clone(),
            local_participant_id: self.local_id.clone(),
            sessions: self
                .sessions
                .values()
                .filter_map(|session| {
                    let status = session.status();
                    // Closed on its own, removal notice still in flight.
                    (!status.state.is_closed()).then(|| SessionSummary {
                        peer_id: session.peer_id().clone(),
                        state: status.state.name(),
                        is_initiator: status.is_initiator,
                        generation: session.generation(),
                        transport_connected: status.transport_connected,
                    })
                })
                .collect(),
            presence_degraded: self.presence.is_degraded(),
            signaling_degraded: self.signals.is_none(),
            is_leaving: self.is_leaving,
        }
    }

    async fn teardown(&mut self) {
        if self.is_leaving {
            return;
        }
        self.is_leaving = true;
        self.signals = None;

        info!(
            target: "mesh.actor.coordinator",
            room_id = %self.room_id,
            sessions = self.sessions.len(),
            "Leaving room"
        );

        // Peer actors must never wait on a coordinator that stopped reading.
        self.notices_rx.close();

        let sessions = std::mem::take(&mut self.sessions);
        let released: Vec<ParticipantId> = sessions.keys().cloned().collect();
        for session in sessions.into_values() {
            session.close(CloseReason::LocalLeave);
        }
        self.join_peer_tasks().await;
        for peer_id in released {
            self.emit(MeshEvent::SessionClosed {
                peer_id,
                reason: CloseReason::LocalLeave,
            });
        }

        match tokio::time::timeout(self.config.relay_send_timeout, self.signaling.mark_departed())
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    target: "mesh.actor.coordinator",
                    room_id = %self.room_id,
                    error = %e,
                    "Failed to announce departure"
                );
            }
            Err(_) => {
                warn!(
                    target: "mesh.actor.coordinator",
                    room_id = %self.room_id,
                    "Departure announcement timed out"
                );
            }
        }

        metrics::set_sessions_active(0);
        self.cancel_token.cancel();
    }

    /// Wait for every peer actor to release its transport. Closing is
    /// bounded by the transport timeout; anything slower is aborted.
    async fn join_peer_tasks(&mut self) {
        let deadline = Instant::now() + self.config.transport_op_timeout;
        for (generation, mut task) in self.peer_tasks.drain() {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                warn!(
                    target: "mesh.actor.coordinator",
                    generation,
                    "Peer actor did not stop in time, aborting"
                );
                task.abort();
            }
        }
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Next inbound signal, or pending forever while the feed is down.
async fn next_signal(
    signals: &mut Option<SignalStream>,
) -> Option<Result<SignalingMessage, MeshError>> {
    match signals {
        Some(stream) => stream.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::LocalMediaSource;
    use crate::signaling::{SessionDescription, SignalKind};
    use crate::testing::{MemoryRelay, MockBehavior, MockTransportFactory, TransportOp};
    use crate::transport::TransportState;
    use std::time::Duration;

    struct Fixture {
        relay: Arc<MemoryRelay>,
        factory: Arc<MockTransportFactory>,
        handle: MeshCoordinatorHandle,
        task: JoinHandle<()>,
    }

    fn test_config() -> Config {
        Config {
            disconnect_grace: Duration::from_secs(5),
            negotiation_timeout: Duration::from_secs(30),
            presence_degraded_grace: Duration::from_secs(15),
            housekeeping_interval: Duration::from_millis(500),
            ..Config::default()
        }
    }

    fn peer(id: &str) -> ParticipantId {
        ParticipantId::new(id)
    }

    async fn join_with(
        relay: &Arc<MemoryRelay>,
        local: &str,
        behavior: MockBehavior,
        config: Config,
    ) -> Fixture {
        let factory = Arc::new(MockTransportFactory::new(behavior));
        let (handle, task) = MeshCoordinator::spawn(
            config,
            Membership::new(RoomId::new("room-1"), peer(local), local.to_uppercase()),
            relay.clone() as Arc<dyn Relay>,
            factory.clone() as Arc<dyn TransportFactory>,
            Arc::new(LocalMediaSource::camera_and_microphone()),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        Fixture {
            relay: relay.clone(),
            factory,
            handle,
            task,
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn announce(relay: &MemoryRelay, id: &str) {
        relay
            .upsert_presence(PresenceRecord::joined(peer(id), RoomId::new("room-1"), id))
            .await
            .unwrap();
    }

    async fn send_raw(relay: &MemoryRelay, from: &str, to: &str, signal: &Signal) {
        let message = SignalingMessage::new(RoomId::new("room-1"), peer(from), peer(to), signal)
            .unwrap();
        relay.insert(message).await.unwrap();
    }

    #[test]
    fn test_initiator_rule_is_antisymmetric() {
        assert!(is_initiator(&peer("a-1"), &peer("b-2")));
        assert!(!is_initiator(&peer("b-2"), &peer("a-1")));
        assert!(!is_initiator(&peer("a-1"), &peer("a-1")));
    }

    #[tokio::test]
    async fn test_spawn_announces_after_subscribing() {
        let relay = Arc::new(MemoryRelay::new());
        let fx = join_with(&relay, "a-1", MockBehavior::default(), test_config()).await;

        let log = relay.log();
        let subscribe = log
            .iter()
            .position(|op| matches!(op, crate::testing::RelayOp::Subscribe(_)))
            .unwrap();
        let query = log
            .iter()
            .position(|op| matches!(op, crate::testing::RelayOp::QueryActive))
            .unwrap();
        let announce = log
            .iter()
            .position(|op| matches!(op, crate::testing::RelayOp::UpsertPresence { active: true, .. }))
            .unwrap();
        assert!(subscribe < query && query < announce);

        let state = fx.handle.get_state().await.unwrap();
        assert!(state.sessions.is_empty());
        assert!(!state.is_leaving);
    }

    #[tokio::test]
    async fn test_spawn_fails_when_relay_unavailable() {
        let relay = Arc::new(MemoryRelay::new());
        relay.set_available(false);

        let result = MeshCoordinator::spawn(
            test_config(),
            Membership::new(RoomId::new("room-1"), peer("a-1"), "A"),
            relay as Arc<dyn Relay>,
            Arc::new(MockTransportFactory::new(MockBehavior::default())),
            Arc::new(LocalMediaSource::default()),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(MeshError::RelayUnavailable(_))));
    }

    #[tokio::test]
    async fn test_lower_id_offers_on_join() {
        let relay = Arc::new(MemoryRelay::new());
        let fx = join_with(&relay, "a-1", MockBehavior::default(), test_config()).await;

        announce(&relay, "b-2").await;
        settle().await;

        assert_eq!(
            relay
                .messages_between(&peer("a-1"), &peer("b-2"), SignalKind::Offer)
                .len(),
            1
        );
        let state = fx.handle.get_state().await.unwrap();
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.sessions.first().unwrap().state, "offering");
        assert!(state.sessions.first().unwrap().is_initiator);
    }

    #[tokio::test]
    async fn test_higher_id_waits_for_offer() {
        let relay = Arc::new(MemoryRelay::new());
        let fx = join_with(&relay, "b-2", MockBehavior::default(), test_config()).await;

        announce(&relay, "a-1").await;
        settle().await;

        assert_eq!(relay.count_kind(SignalKind::Offer), 0);
        let state = fx.handle.get_state().await.unwrap();
        assert_eq!(state.sessions.first().unwrap().state, "new");
    }

    #[tokio::test]
    async fn test_offer_without_session_creates_answering_session() {
        let relay = Arc::new(MemoryRelay::new());
        let fx = join_with(&relay, "b-2", MockBehavior::default(), test_config()).await;

        send_raw(&relay, "a-1", "b-2", &Signal::Offer(SessionDescription::offer("v=0 a"))).await;
        settle().await;

        assert_eq!(
            relay
                .messages_between(&peer("b-2"), &peer("a-1"), SignalKind::Answer)
                .len(),
            1
        );
        // Presence arriving afterwards must not create a second session.
        announce(&relay, "a-1").await;
        settle().await;
        assert_eq!(fx.factory.created_count(), 1);

        let peers = fx.handle.list_connected_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers.first().unwrap().display_name, "a-1");
    }

    #[tokio::test]
    async fn test_stale_answer_creates_nothing() {
        let relay = Arc::new(MemoryRelay::new());
        let fx = join_with(&relay, "a-1", MockBehavior::default(), test_config()).await;

        send_raw(&relay, "z-9", "a-1", &Signal::Answer(SessionDescription::answer("v=0 z"))).await;
        settle().await;

        assert_eq!(fx.factory.created_count(), 0);
        assert!(fx.handle.get_state().await.unwrap().sessions.is_empty());
        assert!(!fx.task.is_finished());
    }

    #[tokio::test]
    async fn test_transport_events_from_old_generation_are_ignored() {
        let relay = Arc::new(MemoryRelay::new());
        let fx = join_with(&relay, "a-1", MockBehavior::default(), test_config()).await;

        announce(&relay, "b-2").await;
        settle().await;
        let first = fx.factory.transport_for(&peer("b-2")).unwrap();

        relay
            .upsert_presence(
                PresenceRecord::joined(peer("b-2"), RoomId::new("room-1"), "b-2").departed(),
            )
            .await
            .unwrap();
        settle().await;
        announce(&relay, "b-2").await;
        settle().await;

        let second = fx.factory.transport_for(&peer("b-2")).unwrap();
        assert_ne!(first.context().generation, second.context().generation);

        first.emit_state(TransportState::Closed).await;
        settle().await;

        let state = fx.handle.get_state().await.unwrap();
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(second.close_count(), 0);
    }

    #[tokio::test]
    async fn test_session_limit_refuses_extra_peer() {
        let relay = Arc::new(MemoryRelay::new());
        let config = Config {
            max_peers: 1,
            ..test_config()
        };
        let fx = join_with(&relay, "a-1", MockBehavior::default(), config).await;
        let mut events = fx.handle.subscribe_events();

        announce(&relay, "b-2").await;
        announce(&relay, "c-3").await;
        settle().await;

        let state = fx.handle.get_state().await.unwrap();
        assert_eq!(state.sessions.len(), 1);
        assert_eq!(state.sessions.first().unwrap().peer_id, peer("b-2"));

        let mut refused = None;
        while let Ok(event) = events.try_recv() {
            if let MeshEvent::SessionFailed { peer_id, error } = event {
                refused = Some((peer_id, error));
            }
        }
        let (peer_id, error) = refused.unwrap();
        assert_eq!(peer_id, peer("c-3"));
        assert!(error.contains("Resource exhausted"));
    }

    #[tokio::test]
    async fn test_set_track_enabled_reaches_every_session_without_signaling() {
        let relay = Arc::new(MemoryRelay::new());
        let fx = join_with(&relay, "a-1", MockBehavior::default(), test_config()).await;

        announce(&relay, "b-2").await;
        announce(&relay, "c-3").await;
        settle().await;
        let before = relay.messages().len();

        fx.handle
            .set_track_enabled(TrackKind::Audio, false)
            .await
            .unwrap();

        for id in ["b-2", "c-3"] {
            let ops = fx.factory.transport_for(&peer(id)).unwrap().ops();
            assert!(ops.contains(&TransportOp::SetTrackEnabled(TrackKind::Audio, false)));
        }
        settle().await;
        assert_eq!(relay.messages().len(), before);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent_and_stops_actor() {
        let relay = Arc::new(MemoryRelay::new());
        let fx = join_with(&relay, "a-1", MockBehavior::default(), test_config()).await;

        announce(&relay, "b-2").await;
        settle().await;

        fx.handle.leave().await.unwrap();
        fx.handle.leave().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), fx.task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(fx.factory.transport_for(&peer("b-2")).unwrap().close_count(), 1);
        assert!(!fx.relay.presence(&peer("a-1")).unwrap().active);
        assert!(fx.handle.is_cancelled());
        assert!(matches!(
            fx.handle.get_state().await,
            Err(MeshError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_cancel_runs_teardown() {
        let relay = Arc::new(MemoryRelay::new());
        let fx = join_with(&relay, "a-1", MockBehavior::default(), test_config()).await;

        announce(&relay, "b-2").await;
        settle().await;

        fx.handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), fx.task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(fx.factory.transport_for(&peer("b-2")).unwrap().close_count(), 1);
        let record = fx.relay.presence(&peer("a-1")).unwrap();
        assert!(!record.active);
        assert!(record.left_at.is_some());
    }

    #[tokio::test]
    async fn test_offer_at_lower_id_takes_answering_role() {
        let relay = Arc::new(MemoryRelay::new());
        let fx = join_with(&relay, "a-1", MockBehavior::default(), test_config()).await;

        send_raw(&relay, "b-2", "a-1", &Signal::Offer(SessionDescription::offer("v=0 b1"))).await;
        settle().await;

        let state = fx.handle.get_state().await.unwrap();
        let summary = state.sessions.first().unwrap();
        assert_eq!(summary.peer_id, peer("b-2"));
        assert!(!summary.is_initiator);
        assert_eq!(relay.count_kind(SignalKind::Offer), 1);

        // The offering side renegotiates; each new offer is answered.
        send_raw(&relay, "b-2", "a-1", &Signal::Offer(SessionDescription::offer("v=0 b2"))).await;
        settle().await;
        assert_eq!(
            relay
                .messages_between(&peer("a-1"), &peer("b-2"), SignalKind::Answer)
                .len(),
            2
        );
        assert_eq!(fx.factory.created_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_peer_does_not_block_other_peers() {
        let relay = Arc::new(MemoryRelay::new());
        let config = Config {
            transport_op_timeout: Duration::from_secs(3),
            ..test_config()
        };
        let stalled = MockBehavior {
            stall_negotiation: true,
            ..MockBehavior::default()
        };
        let fx = join_with(&relay, "a-1", stalled, config).await;

        announce(&relay, "b-2").await;
        settle().await;
        assert!(fx.factory.transport_for(&peer("b-2")).is_some());

        fx.factory.set_behavior(MockBehavior::default());
        let started = Instant::now();
        announce(&relay, "c-3").await;
        settle().await;

        let state = fx.handle.get_state().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(state.sessions.len(), 2);
        assert_eq!(
            relay
                .messages_between(&peer("a-1"), &peer("c-3"), SignalKind::Offer)
                .len(),
            1
        );
        assert_eq!(
            relay
                .messages_between(&peer("a-1"), &peer("b-2"), SignalKind::Offer)
                .len(),
            0
        );

        // Leaving interrupts the stalled offer instead of waiting it out.
        let started = Instant::now();
        fx.handle.leave().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(fx.factory.transport_for(&peer("b-2")).unwrap().close_count(), 1);
        assert_eq!(fx.factory.transport_for(&peer("c-3")).unwrap().close_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_grace_expiry_closes_session() {
        let relay = Arc::new(MemoryRelay::new());
        let fx = join_with(&relay, "a-1", MockBehavior::connected(), test_config()).await;
        let mut events = fx.handle.subscribe_events();

        announce(&relay, "b-2").await;
        settle().await;
        send_raw(&relay, "b-2", "a-1", &Signal::Answer(SessionDescription::answer("v=0 b"))).await;
        settle().await;
        assert_eq!(fx.handle.list_connected_peers().await.unwrap().len(), 1);

        let transport = fx.factory.transport_for(&peer("b-2")).unwrap();
        transport.emit_state(TransportState::Disconnected).await;
        settle().await;

        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;

        assert!(fx.handle.get_state().await.unwrap().sessions.is_empty());
        assert_eq!(transport.close_count(), 1);

        let mut closed = None;
        while let Ok(event) = events.try_recv() {
            if let MeshEvent::SessionClosed { reason, .. } = event {
                closed = Some(reason);
            }
        }
        assert_eq!(closed, Some(CloseReason::DisconnectTimeout));
    }

    #[tokio::test(start_paused = true)]
    async fn test_negotiation_timeout_closes_unconnected_session() {
        let relay = Arc::new(MemoryRelay::new());
        let fx = join_with(&relay, "a-1", MockBehavior::default(), test_config()).await;

        announce(&relay, "b-2").await;
        settle().await;
        assert_eq!(fx.handle.get_state().await.unwrap().sessions.len(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        settle().await;

        assert!(fx.handle.get_state().await.unwrap().sessions.is_empty());
        assert_eq!(fx.factory.transport_for(&peer("b-2")).unwrap().close_count(), 1);
    }
}
