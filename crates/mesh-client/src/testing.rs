//! In-memory relay and scripted transport.
//!
//! Compiled for this crate's own tests and, behind the `test-utils`
//! feature, for dependent crates' tests.

use crate::config::Config;
use crate::errors::MeshError;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::presence::PresenceRecord;
use crate::signaling::message::{
    IceCandidate, SdpType, SessionDescription, SignalKind, SignalingMessage,
};
use crate::signaling::relay::{PresenceFeed, Relay, SignalFeed};
use crate::transport::{
    PeerTransport, TransportContext, TransportEvent, TransportEventKind, TransportFactory,
    TransportState,
};
use async_trait::async_trait;
use common::types::{ParticipantId, RoomId};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

const FEED_CAPACITY: usize = 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered record of side effects shared between a relay and transports,
/// for asserting cross-component ordering.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        lock(&self.0).push(entry.into());
    }

    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    /// Index of the first entry starting with `prefix`.
    #[must_use]
    pub fn position(&self, prefix: &str) -> Option<usize> {
        lock(&self.0).iter().position(|e| e.starts_with(prefix))
    }
}

// ============================================================================
// MemoryRelay
// ============================================================================

/// One call observed by [`MemoryRelay`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOp {
    Insert {
        from: ParticipantId,
        to: ParticipantId,
        kind: SignalKind,
    },
    Subscribe(ParticipantId),
    QueryActive,
    UpsertPresence {
        participant_id: ParticipantId,
        active: bool,
    },
    SubscribePresence,
}

#[derive(Default)]
struct RelayState {
    messages: Vec<SignalingMessage>,
    presence: BTreeMap<ParticipantId, PresenceRecord>,
    signal_subs: Vec<(RoomId, ParticipantId, mpsc::Sender<Result<SignalingMessage, MeshError>>)>,
    presence_subs: Vec<(RoomId, mpsc::Sender<Result<PresenceRecord, MeshError>>)>,
    log: Vec<RelayOp>,
}

/// Relay held entirely in memory, with failure injection.
pub struct MemoryRelay {
    state: Mutex<RelayState>,
    available: AtomicBool,
    fail_departures: AtomicBool,
    stall_inserts: AtomicBool,
    journal: Journal,
}

impl Default for MemoryRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRelay {
    #[must_use]
    pub fn new() -> Self {
        Self::with_journal(Journal::new())
    }

    #[must_use]
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            state: Mutex::new(RelayState::default()),
            available: AtomicBool::new(true),
            fail_departures: AtomicBool::new(false),
            stall_inserts: AtomicBool::new(false),
            journal,
        }
    }

    #[must_use]
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// When `false`, every operation fails with `RelayUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make inactive presence upserts fail.
    pub fn set_fail_departures(&self, fail: bool) {
        self.fail_departures.store(fail, Ordering::SeqCst);
    }

    /// Make inserts hang forever.
    pub fn set_stall_inserts(&self, stall: bool) {
        self.stall_inserts.store(stall, Ordering::SeqCst);
    }

    /// Push an error into every presence feed and drop them.
    pub fn fail_presence_feeds(&self, reason: &str) {
        let subs = std::mem::take(&mut lock(&self.state).presence_subs);
        for (_, tx) in subs {
            let _ = tx.try_send(Err(MeshError::RelayUnavailable(reason.to_string())));
        }
    }

    /// Push an error into every signal feed and drop them.
    pub fn fail_signal_feeds(&self, reason: &str) {
        let subs = std::mem::take(&mut lock(&self.state).signal_subs);
        for (_, _, tx) in subs {
            let _ = tx.try_send(Err(MeshError::RelayUnavailable(reason.to_string())));
        }
    }

    /// Deliver `message` to every signal subscriber of its room, ignoring
    /// the recipient filter.
    pub fn broadcast_raw(&self, message: &SignalingMessage) {
        let state = lock(&self.state);
        for (room_id, _, tx) in &state.signal_subs {
            if *room_id == message.room_id {
                let _ = tx.try_send(Ok(message.clone()));
            }
        }
    }

    #[must_use]
    pub fn messages(&self) -> Vec<SignalingMessage> {
        lock(&self.state).messages.clone()
    }

    /// Messages of `kind` sent from `from` to `to`.
    #[must_use]
    pub fn messages_between(
        &self,
        from: &ParticipantId,
        to: &ParticipantId,
        kind: SignalKind,
    ) -> Vec<SignalingMessage> {
        lock(&self.state)
            .messages
            .iter()
            .filter(|m| m.from_peer_id == *from && m.to_peer_id == *to && m.kind == kind)
            .cloned()
            .collect()
    }

    /// Messages of `kind` in the whole relay.
    #[must_use]
    pub fn count_kind(&self, kind: SignalKind) -> usize {
        lock(&self.state)
            .messages
            .iter()
            .filter(|m| m.kind == kind)
            .count()
    }

    #[must_use]
    pub fn presence(&self, participant_id: &ParticipantId) -> Option<PresenceRecord> {
        lock(&self.state).presence.get(participant_id).cloned()
    }

    #[must_use]
    pub fn log(&self) -> Vec<RelayOp> {
        lock(&self.state).log.clone()
    }

    fn check_available(&self) -> Result<(), MeshError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MeshError::RelayUnavailable("relay offline".to_string()))
        }
    }
}

#[async_trait]
impl Relay for MemoryRelay {
    async fn insert(&self, message: SignalingMessage) -> Result<(), MeshError> {
        self.check_available()?;
        if self.stall_inserts.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        self.journal.record(format!(
            "relay:insert:{}:{}->{}",
            message.kind, message.from_peer_id, message.to_peer_id
        ));

        let mut state = lock(&self.state);
        state.log.push(RelayOp::Insert {
            from: message.from_peer_id.clone(),
            to: message.to_peer_id.clone(),
            kind: message.kind,
        });
        state.signal_subs.retain(|(_, _, tx)| !tx.is_closed());
        for (room_id, to, tx) in &state.signal_subs {
            if *room_id == message.room_id && *to == message.to_peer_id {
                let _ = tx.try_send(Ok(message.clone()));
            }
        }
        state.messages.push(message);
        Ok(())
    }

    async fn subscribe(&self, room_id: &RoomId, to: &ParticipantId) -> Result<SignalFeed, MeshError> {
        self.check_available()?;
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);

        let mut state = lock(&self.state);
        state.log.push(RelayOp::Subscribe(to.clone()));
        state.signal_subs.push((room_id.clone(), to.clone(), tx));
        Ok(rx)
    }

    async fn query_active(&self, room_id: &RoomId) -> Result<Vec<PresenceRecord>, MeshError> {
        self.check_available()?;

        let mut state = lock(&self.state);
        state.log.push(RelayOp::QueryActive);
        Ok(state
            .presence
            .values()
            .filter(|r| r.room_id == *room_id && r.active)
            .cloned()
            .collect())
    }

    async fn upsert_presence(&self, record: PresenceRecord) -> Result<(), MeshError> {
        self.check_available()?;
        if !record.active && self.fail_departures.load(Ordering::SeqCst) {
            return Err(MeshError::RelayUnavailable("departure rejected".to_string()));
        }

        self.journal.record(format!(
            "relay:upsert_presence:{}:{}",
            record.participant_id,
            if record.active { "active" } else { "inactive" }
        ));

        let mut state = lock(&self.state);
        state.log.push(RelayOp::UpsertPresence {
            participant_id: record.participant_id.clone(),
            active: record.active,
        });
        state.presence_subs.retain(|(_, tx)| !tx.is_closed());
        for (room_id, tx) in &state.presence_subs {
            if *room_id == record.room_id {
                let _ = tx.try_send(Ok(record.clone()));
            }
        }
        state
            .presence
            .insert(record.participant_id.clone(), record);
        Ok(())
    }

    async fn subscribe_presence(&self, room_id: &RoomId) -> Result<PresenceFeed, MeshError> {
        self.check_available()?;
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);

        let mut state = lock(&self.state);
        state.log.push(RelayOp::SubscribePresence);
        state.presence_subs.push((room_id.clone(), tx));
        Ok(rx)
    }
}

// ============================================================================
// MockTransport
// ============================================================================

/// One call observed by a [`MockTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOp {
    AttachTracks(Vec<String>),
    CreateOffer(String),
    CreateAnswer(String),
    SetRemoteDescription(SdpType, String),
    AddRemoteCandidate(String),
    SetTrackEnabled(TrackKind, bool),
    Close,
}

/// Scripted behavior for transports built by a [`MockTransportFactory`].
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Report `Connected` once both descriptions are applied.
    pub auto_connect: bool,
    /// Local candidates emitted after each local description.
    pub emit_candidates: usize,
    /// Report one remote audio track on connect.
    pub emit_remote_track: bool,
    /// Offer, answer and remote description calls never complete.
    pub stall_negotiation: bool,
    /// `create` fails.
    pub fail_create: bool,
}

impl MockBehavior {
    /// Transports that connect as soon as negotiation completes.
    #[must_use]
    pub fn connected() -> Self {
        Self {
            auto_connect: true,
            emit_candidates: 1,
            emit_remote_track: true,
            ..Self::default()
        }
    }
}

struct MockShared {
    context: TransportContext,
    events: mpsc::Sender<TransportEvent>,
    ops: Mutex<Vec<TransportOp>>,
    closes: AtomicUsize,
    journal: Journal,
}

/// Inspection and event-injection handle for one mock transport.
#[derive(Clone)]
pub struct MockTransportHandle {
    shared: Arc<MockShared>,
}

impl MockTransportHandle {
    #[must_use]
    pub fn context(&self) -> &TransportContext {
        &self.shared.context
    }

    #[must_use]
    pub fn ops(&self) -> Vec<TransportOp> {
        lock(&self.shared.ops).clone()
    }

    #[must_use]
    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Emit an event as the transport would.
    pub async fn emit(&self, kind: TransportEventKind) {
        let _ = self
            .shared
            .events
            .send(TransportEvent::new(&self.shared.context, kind))
            .await;
    }

    pub async fn emit_state(&self, state: TransportState) {
        self.emit(TransportEventKind::StateChanged(state)).await;
    }

    pub async fn emit_candidate(&self, line: &str) {
        self.emit(TransportEventKind::LocalCandidate(IceCandidate::new(line)))
            .await;
    }

    fn record(&self, op: TransportOp) {
        lock(&self.shared.ops).push(op);
    }

    fn try_emit(&self, kind: TransportEventKind) {
        let _ = self
            .shared
            .events
            .try_send(TransportEvent::new(&self.shared.context, kind));
    }
}

/// Scripted [`PeerTransport`].
pub struct MockTransport {
    handle: MockTransportHandle,
    behavior: MockBehavior,
    seq: u32,
    has_local: bool,
    has_remote: bool,
    connected: bool,
}

impl MockTransport {
    fn after_local_description(&mut self) {
        let context = self.handle.shared.context.clone();
        for i in 0..self.behavior.emit_candidates {
            self.handle.try_emit(TransportEventKind::LocalCandidate(IceCandidate::new(
                format!(
                    "candidate:{} {} udp 2122260223 10.0.0.{} 5000 typ host",
                    context.generation,
                    self.seq,
                    i + 1
                ),
            )));
        }
        self.maybe_connect();
    }

    fn maybe_connect(&mut self) {
        if !self.behavior.auto_connect || self.connected || !(self.has_local && self.has_remote) {
            return;
        }
        self.connected = true;

        let peer = self.handle.shared.context.peer_id.clone();
        self.handle
            .try_emit(TransportEventKind::StateChanged(TransportState::Connected));
        if self.behavior.emit_remote_track {
            self.handle
                .try_emit(TransportEventKind::RemoteTrack(RemoteTrack {
                    id: format!("{peer}-audio"),
                    kind: TrackKind::Audio,
                    stream_id: peer.to_string(),
                }));
        }
    }

    async fn stall_if_configured(&self) {
        if self.behavior.stall_negotiation {
            std::future::pending::<()>().await;
        }
    }

    fn sdp(&mut self, role: &str) -> String {
        self.seq += 1;
        let context = &self.handle.shared.context;
        format!(
            "v=0 mock-{role} peer={} gen={} seq={}",
            context.peer_id, context.generation, self.seq
        )
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn attach_tracks(&mut self, tracks: &[LocalTrack]) -> Result<(), MeshError> {
        self.handle.record(TransportOp::AttachTracks(
            tracks.iter().map(|t| t.id.clone()).collect(),
        ));
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, MeshError> {
        self.stall_if_configured().await;
        let sdp = self.sdp("offer");
        self.handle.record(TransportOp::CreateOffer(sdp.clone()));
        self.has_local = true;
        self.after_local_description();
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MeshError> {
        self.stall_if_configured().await;
        if !self.has_remote {
            return Err(MeshError::Transport("no remote offer".to_string()));
        }
        let sdp = self.sdp("answer");
        self.handle.record(TransportOp::CreateAnswer(sdp.clone()));
        self.has_local = true;
        self.after_local_description();
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MeshError> {
        self.stall_if_configured().await;
        self.handle.record(TransportOp::SetRemoteDescription(
            description.sdp_type,
            description.sdp.clone(),
        ));
        self.has_remote = true;
        self.maybe_connect();
        Ok(())
    }

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MeshError> {
        if !self.has_remote {
            return Err(MeshError::Transport(
                "candidate before remote description".to_string(),
            ));
        }
        self.handle
            .record(TransportOp::AddRemoteCandidate(candidate.candidate.clone()));
        Ok(())
    }

    async fn set_track_enabled(
        &mut self,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<(), MeshError> {
        self.handle.record(TransportOp::SetTrackEnabled(kind, enabled));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MeshError> {
        self.handle.record(TransportOp::Close);
        self.handle.shared.closes.fetch_add(1, Ordering::SeqCst);
        self.handle
            .shared
            .journal
            .record(format!("transport:close:{}", self.handle.shared.context.peer_id));
        Ok(())
    }
}

/// Builds [`MockTransport`]s and keeps a handle to each.
pub struct MockTransportFactory {
    behavior: Mutex<MockBehavior>,
    transports: Mutex<Vec<MockTransportHandle>>,
    journal: Journal,
}

impl MockTransportFactory {
    #[must_use]
    pub fn new(behavior: MockBehavior) -> Self {
        Self::with_journal(behavior, Journal::new())
    }

    #[must_use]
    pub fn with_journal(behavior: MockBehavior, journal: Journal) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            transports: Mutex::new(Vec::new()),
            journal,
        }
    }

    /// Behavior for transports created from now on.
    pub fn set_behavior(&self, behavior: MockBehavior) {
        *lock(&self.behavior) = behavior;
    }

    /// Most recently created transport for `peer_id`.
    #[must_use]
    pub fn transport_for(&self, peer_id: &ParticipantId) -> Option<MockTransportHandle> {
        lock(&self.transports)
            .iter()
            .rev()
            .find(|h| h.shared.context.peer_id == *peer_id)
            .cloned()
    }

    /// Every transport ever created for `peer_id`, oldest first.
    #[must_use]
    pub fn transports_for(&self, peer_id: &ParticipantId) -> Vec<MockTransportHandle> {
        lock(&self.transports)
            .iter()
            .filter(|h| h.shared.context.peer_id == *peer_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn created_count(&self) -> usize {
        lock(&self.transports).len()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        context: TransportContext,
        _config: &Config,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, MeshError> {
        let behavior = lock(&self.behavior).clone();
        if behavior.fail_create {
            return Err(MeshError::Transport("transport allocation failed".to_string()));
        }

        let handle = MockTransportHandle {
            shared: Arc::new(MockShared {
                context,
                events,
                ops: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
                journal: self.journal.clone(),
            }),
        };
        lock(&self.transports).push(handle.clone());

        Ok(Box::new(MockTransport {
            handle,
            behavior,
            seq: 0,
            has_local: false,
            has_remote: false,
            connected: false,
        }))
    }
}
