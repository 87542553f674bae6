//! `PeerActor` - one task per remote participant.
//!
//! Each `PeerActor`:
//! - Creates the transport and owns the `PeerSession` for one peer
//! - Applies inbound signals, transport events and local track changes
//! - Sends its outbound signals through its own `Outbox`
//! - Runs its own disconnect-grace and negotiation timers
//!
//! Transport calls only ever wait on this task, so a stalled transport holds
//! up its own peer and nobody else. A close request interrupts whatever
//! transport call is in flight.
//!
//! # Lifecycle
//!
//! 1. Spawned by the coordinator when a peer joins or offers
//! 2. Runs until its session closes or the coordinator asks it to close
//! 3. Reports `Closed` (or `Failed` if the session never opened) and exits

use crate::config::Config;
use crate::errors::MeshError;
use crate::media::{LocalTrack, RemoteStream, TrackKind};
use crate::session::{CloseReason, Outbound, PeerSession, SessionState};
use crate::signaling::{Signal, SignalingClient};
use crate::transport::{
    PeerTransport, TransportContext, TransportEvent, TransportEventKind, TransportFactory,
};

use super::outbox::{Outbox, OutboxHandle};

use common::types::ParticipantId;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Channel buffer size for events from one peer's transport.
const TRANSPORT_EVENT_BUFFER: usize = 256;

/// Work for a `PeerActor`.
#[derive(Debug)]
pub(crate) enum PeerCommand {
    /// An inbound signal from this peer.
    Signal(Signal),
    /// The local track list changed.
    UpdateTracks(Vec<LocalTrack>),
    /// Mute/unmute or camera on/off. `done` fires once applied.
    SetTrackEnabled {
        kind: TrackKind,
        enabled: bool,
        done: oneshot::Sender<()>,
    },
}

/// What a `PeerActor` reports back to the coordinator.
#[derive(Debug)]
pub(crate) enum PeerNotice {
    /// The session reached `Connected` (first time or after recovery).
    Connected {
        peer_id: ParticipantId,
        generation: u64,
    },
    /// The session closed and the actor exited.
    Closed {
        peer_id: ParticipantId,
        generation: u64,
        reason: CloseReason,
    },
    /// The session could not be opened and the actor exited.
    Failed {
        peer_id: ParticipantId,
        generation: u64,
        error: MeshError,
    },
}

/// Latest view of one session, readable without a round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeerStatus {
    pub state: SessionState,
    pub is_initiator: bool,
    pub transport_connected: bool,
    pub remote_stream: Option<RemoteStream>,
}

impl PeerStatus {
    fn of(session: &PeerSession) -> Self {
        Self {
            state: session.state(),
            is_initiator: session.is_initiator(),
            transport_connected: session.transport_connected(),
            remote_stream: session.remote_stream().cloned(),
        }
    }
}

/// Handle to a `PeerActor`, owned by the coordinator.
pub(crate) struct PeerActorHandle {
    sender: mpsc::UnboundedSender<PeerCommand>,
    close_tx: oneshot::Sender<CloseReason>,
    status: watch::Receiver<PeerStatus>,
    peer_id: ParticipantId,
    generation: u64,
}

impl PeerActorHandle {
    pub(crate) fn peer_id(&self) -> &ParticipantId {
        &self.peer_id
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn status(&self) -> PeerStatus {
        self.status.borrow().clone()
    }

    /// Queue `command` without waiting on the actor.
    pub(crate) fn send(&self, command: PeerCommand) {
        if self.sender.send(command).is_err() {
            debug!(
                target: "mesh.actor.peer",
                peer_id = %self.peer_id,
                generation = self.generation,
                "Peer actor gone, command dropped"
            );
        }
    }

    /// Ask the actor to close its session, interrupting any transport call
    /// in flight.
    pub(crate) fn close(self, reason: CloseReason) {
        // The actor may already be on its way out.
        let _ = self.close_tx.send(reason);
    }
}

/// Everything a new `PeerActor` needs to know about its peer.
#[derive(Debug, Clone)]
pub(crate) struct PeerSetup {
    pub peer_id: ParticipantId,
    pub generation: u64,
    pub is_initiator: bool,
    pub tracks: Vec<LocalTrack>,
}

/// Immutable part of a running actor.
struct PeerContext {
    peer_id: ParticipantId,
    generation: u64,
    config: Config,
    notices: mpsc::Sender<PeerNotice>,
    status: watch::Sender<PeerStatus>,
    outbox: OutboxHandle,
    cancel_token: CancellationToken,
}

/// What woke the actor up.
enum Step {
    Work(Work),
    Close(CloseReason),
}

/// One unit of session work, abandoned if a close request arrives first.
enum Work {
    Command(PeerCommand),
    Transport(TransportEvent),
    Tick,
}

/// The `PeerActor` implementation.
pub(crate) struct PeerActor {
    ctx: PeerContext,
    setup: PeerSetup,
    transports: Arc<dyn TransportFactory>,
    receiver: mpsc::UnboundedReceiver<PeerCommand>,
    close_rx: oneshot::Receiver<CloseReason>,
}

impl PeerActor {
    /// Spawn an actor for `setup.peer_id`.
    ///
    /// `cancel_token` should be a child of the coordinator's token.
    pub(crate) fn spawn(
        setup: PeerSetup,
        config: Config,
        transports: Arc<dyn TransportFactory>,
        signaling: SignalingClient,
        notices: mpsc::Sender<PeerNotice>,
        cancel_token: CancellationToken,
    ) -> (PeerActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();
        let (status_tx, status_rx) = watch::channel(PeerStatus {
            state: SessionState::New,
            is_initiator: setup.is_initiator,
            transport_connected: false,
            remote_stream: None,
        });

        let (outbox, _outbox_task) = Outbox::spawn(
            setup.peer_id.clone(),
            signaling,
            config.relay_send_timeout,
            cancel_token.child_token(),
        );

        let handle = PeerActorHandle {
            sender,
            close_tx,
            status: status_rx,
            peer_id: setup.peer_id.clone(),
            generation: setup.generation,
        };

        let actor = Self {
            ctx: PeerContext {
                peer_id: setup.peer_id.clone(),
                generation: setup.generation,
                config,
                notices,
                status: status_tx,
                outbox,
                cancel_token,
            },
            setup,
            transports,
            receiver,
            close_rx,
        };
        let task_handle = tokio::spawn(actor.run());

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(
        skip_all,
        name = "mesh.actor.peer",
        fields(peer_id = %self.ctx.peer_id, generation = self.ctx.generation)
    )]
    async fn run(self) {
        let Self {
            ctx,
            setup,
            transports,
            mut receiver,
            mut close_rx,
        } = self;

        debug!(
            target: "mesh.actor.peer",
            peer_id = %ctx.peer_id,
            generation = ctx.generation,
            is_initiator = setup.is_initiator,
            "PeerActor started"
        );

        let (event_tx, mut event_rx) = mpsc::channel(TRANSPORT_EVENT_BUFFER);

        // Creating the transport is the one step with no session to close
        // if it is interrupted.
        let created = tokio::select! {
            biased;
            reason = close_requested(&mut close_rx, &ctx.cancel_token) => {
                ctx.exit_closed(reason).await;
                return;
            }
            created = ctx.create_transport(transports.as_ref(), event_tx) => created,
        };
        let transport = match created {
            Ok(transport) => transport,
            Err(e) => {
                ctx.exit_failed(e).await;
                return;
            }
        };

        let mut session = PeerSession::new(
            ctx.peer_id.clone(),
            ctx.generation,
            setup.is_initiator,
            transport,
            &setup.tracks,
            ctx.config.transport_op_timeout,
        );

        let opened = tokio::select! {
            biased;
            reason = close_requested(&mut close_rx, &ctx.cancel_token) => Err(reason),
            opened = ctx.open(&mut session) => Ok(opened),
        };
        match opened {
            Err(reason) => {
                ctx.finish(&mut session, reason).await;
                return;
            }
            Ok(Err(e)) => {
                ctx.exit_failed(e).await;
                return;
            }
            Ok(Ok(())) => {}
        }
        ctx.publish(&session, false).await;

        let mut housekeeping = tokio::time::interval(ctx.config.housekeeping_interval);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if session.is_closed() {
                ctx.exit_closed(closed_reason(&session)).await;
                break;
            }

            let step = tokio::select! {
                biased;
                reason = close_requested(&mut close_rx, &ctx.cancel_token) => Step::Close(reason),
                command = receiver.recv() => match command {
                    Some(command) => Step::Work(Work::Command(command)),
                    None => Step::Close(CloseReason::LocalLeave),
                },
                Some(event) = event_rx.recv() => Step::Work(Work::Transport(event)),
                _ = housekeeping.tick() => Step::Work(Work::Tick),
            };

            let work = match step {
                Step::Work(work) => work,
                Step::Close(reason) => {
                    ctx.finish(&mut session, reason).await;
                    break;
                }
            };

            let was_connected = session.state() == SessionState::Connected;
            let interrupted = tokio::select! {
                biased;
                reason = close_requested(&mut close_rx, &ctx.cancel_token) => Some(reason),
                () = ctx.apply(&mut session, work) => None,
            };
            if let Some(reason) = interrupted {
                ctx.finish(&mut session, reason).await;
                break;
            }
            ctx.publish(&session, was_connected).await;
        }

        debug!(
            target: "mesh.actor.peer",
            peer_id = %ctx.peer_id,
            generation = ctx.generation,
            "PeerActor stopped"
        );
    }
}

impl PeerContext {
    async fn create_transport(
        &self,
        transports: &dyn TransportFactory,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, MeshError> {
        let context = TransportContext {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
        };
        tokio::time::timeout(
            self.config.transport_op_timeout,
            transports.create(context, &self.config, events),
        )
        .await
        .map_err(|_| MeshError::Transport("transport creation timed out".to_string()))?
    }

    /// Attach tracks and, as initiator, send the first offer.
    async fn open(&self, session: &mut PeerSession) -> Result<(), MeshError> {
        session.open().await?;
        if session.is_initiator() {
            let outbound = session.start_offer(Instant::now()).await;
            self.route(outbound);
        }
        Ok(())
    }

    async fn apply(&self, session: &mut PeerSession, work: Work) {
        let now = Instant::now();
        match work {
            Work::Command(PeerCommand::Signal(signal)) => {
                let outbound = session.handle_signal(signal, now).await;
                self.route(outbound);
            }
            Work::Command(PeerCommand::UpdateTracks(tracks)) => {
                let outbound = session.update_tracks(&tracks, now).await;
                self.route(outbound);
            }
            Work::Command(PeerCommand::SetTrackEnabled {
                kind,
                enabled,
                done,
            }) => {
                session.set_track_enabled(kind, enabled).await;
                let _ = done.send(());
            }
            Work::Transport(event) => self.on_transport_event(session, event, now).await,
            Work::Tick => self.check_timers(session, now).await,
        }
    }

    async fn on_transport_event(
        &self,
        session: &mut PeerSession,
        event: TransportEvent,
        now: Instant,
    ) {
        if event.generation != self.generation {
            debug!(
                target: "mesh.actor.peer",
                peer_id = %self.peer_id,
                event_generation = event.generation,
                session_generation = self.generation,
                "Transport event from previous session"
            );
            return;
        }

        match event.kind {
            TransportEventKind::LocalCandidate(candidate) => {
                self.route(session.on_local_candidate(candidate).into_iter().collect());
            }
            TransportEventKind::StateChanged(state) => {
                let outbound = session.on_transport_state(state, now).await;
                self.route(outbound);
            }
            TransportEventKind::RemoteTrack(track) => session.on_remote_track(track),
        }
    }

    /// Close the session if its grace or negotiation window ran out.
    async fn check_timers(&self, session: &mut PeerSession, now: Instant) {
        let grace = self.config.disconnect_grace;
        let negotiation_timeout = self.config.negotiation_timeout;

        if session.disconnect_expired(now, grace) {
            info!(
                target: "mesh.actor.peer",
                peer_id = %self.peer_id,
                grace_ms = grace.as_millis(),
                "Disconnected past grace period"
            );
            session.close(CloseReason::DisconnectTimeout).await;
        } else if session.negotiation_expired(now, negotiation_timeout) {
            warn!(
                target: "mesh.actor.peer",
                peer_id = %self.peer_id,
                state = session.state().name(),
                timeout_ms = negotiation_timeout.as_millis(),
                "Negotiation timed out"
            );
            session.close(CloseReason::NegotiationFailed).await;
        }
    }

    fn route(&self, outbound: Vec<Outbound>) {
        for Outbound { to, signal } in outbound {
            if to == self.peer_id {
                self.outbox.enqueue(signal);
            } else {
                warn!(
                    target: "mesh.actor.peer",
                    peer_id = %self.peer_id,
                    to = %to,
                    kind = %signal.kind(),
                    "Signal addressed to another peer dropped"
                );
            }
        }
    }

    /// Publish the session's status, then report a fresh `Connected`.
    async fn publish(&self, session: &PeerSession, was_connected: bool) {
        self.status.send_replace(PeerStatus::of(session));

        if session.state() == SessionState::Connected && !was_connected {
            self.notify(PeerNotice::Connected {
                peer_id: self.peer_id.clone(),
                generation: self.generation,
            })
            .await;
        }
    }

    /// Close the session on request and exit.
    async fn finish(&self, session: &mut PeerSession, reason: CloseReason) {
        session.close(reason).await;
        self.exit_closed(closed_reason(session)).await;
    }

    async fn exit_closed(&self, reason: CloseReason) {
        self.status.send_modify(|status| status.state = SessionState::Closed { reason });
        self.outbox.cancel();
        self.notify(PeerNotice::Closed {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            reason,
        })
        .await;
    }

    async fn exit_failed(&self, error: MeshError) {
        warn!(
            target: "mesh.actor.peer",
            peer_id = %self.peer_id,
            generation = self.generation,
            error = %error,
            "Failed to open session"
        );
        self.outbox.cancel();
        self.notify(PeerNotice::Failed {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            error,
        })
        .await;
    }

    async fn notify(&self, notice: PeerNotice) {
        // Fails only once the coordinator is tearing down.
        let _ = self.notices.send(notice).await;
    }
}

fn closed_reason(session: &PeerSession) -> CloseReason {
    match session.state() {
        SessionState::Closed { reason } => reason,
        _ => CloseReason::LocalLeave,
    }
}

/// Resolves once the coordinator asks this actor to close.
async fn close_requested(
    close_rx: &mut oneshot::Receiver<CloseReason>,
    cancel_token: &CancellationToken,
) -> CloseReason {
    tokio::select! {
        biased;
        reason = close_rx => reason.unwrap_or(CloseReason::LocalLeave),
        () = cancel_token.cancelled() => CloseReason::LocalLeave,
    }
}
