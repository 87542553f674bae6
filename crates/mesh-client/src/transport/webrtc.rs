//! `PeerTransport` backed by webrtc-rs.
//!
//! One `RTCPeerConnection` per peer session. Local tracks are
//! `TrackLocalStaticSample`s shared across every session and keyed by
//! `LocalTrack::id`, so the embedder writes each sample once and it fans out
//! to all peers. Muting swaps the sender's track out instead of
//! renegotiating.

use crate::config::Config;
use crate::errors::MeshError;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::signaling::message::{IceCandidate, SdpType, SessionDescription};
use crate::transport::{
    PeerTransport, TransportContext, TransportEvent, TransportEventKind, TransportFactory,
    TransportState,
};

use async_trait::async_trait;
use common::secret::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Stream id stamped on every local track.
const LOCAL_STREAM_ID: &str = "mesh-local";

type SharedTracks = Arc<Mutex<HashMap<String, Arc<TrackLocalStaticSample>>>>;

fn transport_error(op: &'static str) -> impl FnOnce(webrtc::Error) -> MeshError {
    move |e| MeshError::Transport(format!("{op}: {e}"))
}

/// Map a peer connection state onto the mesh's view of connectivity.
#[must_use]
pub fn map_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        _ => None,
    }
}

/// Codec used for outbound tracks of `kind`.
#[must_use]
pub fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48_000,
            channels: 2,
            sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
            rtcp_feedback: vec![],
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90_000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        },
    }
}

fn ice_servers(config: &Config) -> Vec<RTCIceServer> {
    let username = config.turn_username.clone().unwrap_or_default();
    let credential = config
        .turn_credential
        .as_ref()
        .map(|c| c.expose_secret().to_string())
        .unwrap_or_default();

    config
        .ice_servers
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            username: username.clone(),
            credential: credential.clone(),
            ..Default::default()
        })
        .collect()
}

/// Builds one `RTCPeerConnection` per peer session.
#[derive(Default)]
pub struct WebRtcTransportFactory {
    tracks: SharedTracks,
}

impl WebRtcTransportFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample sink for `track`, shared by every session it is attached to.
    pub async fn local_track(&self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        shared_track(&self.tracks, track).await
    }
}

async fn shared_track(tracks: &SharedTracks, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
    tracks
        .lock()
        .await
        .entry(track.id.clone())
        .or_insert_with(|| {
            Arc::new(TrackLocalStaticSample::new(
                codec_for(track.kind),
                track.id.clone(),
                LOCAL_STREAM_ID.to_string(),
            ))
        })
        .clone()
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        context: TransportContext,
        config: &Config,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Box<dyn PeerTransport>, MeshError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_error("register codecs"))?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(transport_error("register interceptors"))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: ice_servers(config),
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(transport_error("new peer connection"))?,
        );

        register_callbacks(&peer_connection, &context, &events);

        debug!(
            target: "mesh.transport",
            peer_id = %context.peer_id,
            generation = context.generation,
            ice_servers = config.ice_servers.len(),
            "Peer connection created"
        );

        Ok(Box::new(WebRtcTransport {
            context,
            peer_connection,
            tracks: self.tracks.clone(),
            attached: HashMap::new(),
        }))
    }
}

/// Deliver an event to the owning session, waiting for room in its channel.
///
/// Only fails once the session is gone.
async fn emit(
    events: &mpsc::Sender<TransportEvent>,
    context: &TransportContext,
    kind: TransportEventKind,
) {
    if events.send(TransportEvent::new(context, kind)).await.is_err() {
        debug!(
            target: "mesh.transport",
            peer_id = %context.peer_id,
            generation = context.generation,
            "Session gone, transport event discarded"
        );
    }
}

fn register_callbacks(
    peer_connection: &RTCPeerConnection,
    context: &TransportContext,
    events: &mpsc::Sender<TransportEvent>,
) {
    let (ctx, tx) = (context.clone(), events.clone());
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            let (ctx, tx) = (ctx.clone(), tx.clone());
            Box::pin(async move {
                if let Some(state) = map_state(state) {
                    debug!(
                        target: "mesh.transport",
                        peer_id = %ctx.peer_id,
                        state = %state,
                        "Peer connection state changed"
                    );
                    emit(&tx, &ctx, TransportEventKind::StateChanged(state)).await;
                }
            })
        },
    ));

    let (ctx, tx) = (context.clone(), events.clone());
    peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let (ctx, tx) = (ctx.clone(), tx.clone());
        Box::pin(async move {
            // `None` marks the end of gathering.
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    emit(
                        &tx,
                        &ctx,
                        TransportEventKind::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_m_line_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                    )
                    .await;
                }
                Err(e) => {
                    warn!(
                        target: "mesh.transport",
                        peer_id = %ctx.peer_id,
                        error = %e,
                        "Failed to serialize local candidate"
                    );
                }
            }
        })
    }));

    let (ctx, tx) = (context.clone(), events.clone());
    peer_connection.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
        let (ctx, tx) = (ctx.clone(), tx.clone());
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                _ => return,
            };
            emit(
                &tx,
                &ctx,
                TransportEventKind::RemoteTrack(RemoteTrack {
                    id: track.id(),
                    kind,
                    stream_id: track.stream_id(),
                }),
            )
            .await;
        })
    }));
}

struct Attached {
    track: LocalTrack,
    sample: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
}

/// One `RTCPeerConnection` to one peer.
pub struct WebRtcTransport {
    context: TransportContext,
    peer_connection: Arc<RTCPeerConnection>,
    tracks: SharedTracks,
    attached: HashMap<String, Attached>,
}

impl WebRtcTransport {
    async fn set_sender_enabled(&self, attached: &Attached, enabled: bool) -> Result<(), MeshError> {
        let replacement = if enabled {
            Some(attached.sample.clone() as Arc<dyn TrackLocal + Send + Sync>)
        } else {
            None
        };
        attached
            .sender
            .replace_track(replacement)
            .await
            .map_err(transport_error("replace track"))
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn attach_tracks(&mut self, tracks: &[LocalTrack]) -> Result<(), MeshError> {
        let stale: Vec<String> = self
            .attached
            .keys()
            .filter(|id| !tracks.iter().any(|t| &t.id == *id))
            .cloned()
            .collect();
        for id in stale {
            if let Some(attached) = self.attached.remove(&id) {
                self.peer_connection
                    .remove_track(&attached.sender)
                    .await
                    .map_err(transport_error("remove track"))?;
            }
        }

        for track in tracks {
            if self.attached.contains_key(&track.id) {
                continue;
            }
            let sample = shared_track(&self.tracks, track).await;
            let sender = self
                .peer_connection
                .add_track(sample.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(transport_error("add track"))?;

            let attached = Attached {
                track: track.clone(),
                sample,
                sender,
            };
            if !track.enabled {
                self.set_sender_enabled(&attached, false).await?;
            }
            self.attached.insert(track.id.clone(), attached);
        }

        debug!(
            target: "mesh.transport",
            peer_id = %self.context.peer_id,
            tracks = self.attached.len(),
            "Tracks attached"
        );
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription, MeshError> {
        let offer = self
            .peer_connection
            .create_offer(None)
            .await
            .map_err(transport_error("create offer"))?;
        let sdp = offer.sdp.clone();
        self.peer_connection
            .set_local_description(offer)
            .await
            .map_err(transport_error("set local offer"))?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription, MeshError> {
        let answer = self
            .peer_connection
            .create_answer(None)
            .await
            .map_err(transport_error("create answer"))?;
        let sdp = answer.sdp.clone();
        self.peer_connection
            .set_local_description(answer)
            .await
            .map_err(transport_error("set local answer"))?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(
        &mut self,
        description: &SessionDescription,
    ) -> Result<(), MeshError> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp.clone()),
        }
        .map_err(transport_error("parse remote description"))?;

        self.peer_connection
            .set_remote_description(remote)
            .await
            .map_err(transport_error("set remote description"))
    }

    async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> Result<(), MeshError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: candidate.username_fragment.clone(),
        };
        self.peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(transport_error("add candidate"))
    }

    async fn set_track_enabled(
        &mut self,
        kind: TrackKind,
        enabled: bool,
    ) -> Result<(), MeshError> {
        for attached in self.attached.values().filter(|a| a.track.kind == kind) {
            self.set_sender_enabled(attached, enabled).await?;
        }
        for attached in self.attached.values_mut().filter(|a| a.track.kind == kind) {
            attached.track.enabled = enabled;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), MeshError> {
        self.attached.clear();
        self.peer_connection
            .close()
            .await
            .map_err(transport_error("close"))
    }
}
