//! Signaling wire types.
//!
//! One [`SignalingMessage`] is one relay record. The payload shape follows
//! the browser JSON encodings: `{"offer": {type, sdp}}`,
//! `{"answer": {type, sdp}}` and `{"candidate": RTCIceCandidateInit}`.

use crate::errors::MeshError;
use chrono::{DateTime, Utc};
use common::types::{ParticipantId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Kind tag of a signaling message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalKind {
    #[serde(rename = "offer")]
    Offer,
    #[serde(rename = "answer")]
    Answer,
    #[serde(rename = "ice-candidate")]
    Candidate,
}

impl SignalKind {
    /// Wire name, also used as a bounded metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "ice-candidate",
        }
    }

    fn payload_field(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SDP role carried in a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description (`RTCSessionDescriptionInit` JSON shape).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network-path candidate (`RTCIceCandidateInit` JSON shape).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set.
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

/// A decoded signal, ready for a peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl Signal {
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self {
            Signal::Offer(_) => SignalKind::Offer,
            Signal::Answer(_) => SignalKind::Answer,
            Signal::Candidate(_) => SignalKind::Candidate,
        }
    }

    /// Encode as a relay payload object.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Internal` if the value cannot be serialized.
    pub fn to_payload(&self) -> Result<Value, MeshError> {
        let inner = match self {
            Signal::Offer(desc) | Signal::Answer(desc) => serde_json::to_value(desc),
            Signal::Candidate(candidate) => serde_json::to_value(candidate),
        }
        .map_err(|e| MeshError::Internal(format!("payload encode failed: {e}")))?;

        Ok(json!({ self.kind().payload_field(): inner }))
    }

    /// Decode the payload of `message` according to its kind tag.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::MalformedSignal` when the field expected for the
    /// kind is missing, has the wrong shape, or carries the wrong SDP type.
    pub fn from_message(message: &SignalingMessage) -> Result<Self, MeshError> {
        let field = message.kind.payload_field();
        let inner = message.payload.get(field).ok_or_else(|| {
            MeshError::MalformedSignal(format!("{} payload missing '{field}'", message.kind))
        })?;

        match message.kind {
            SignalKind::Offer | SignalKind::Answer => {
                let desc: SessionDescription = serde_json::from_value(inner.clone())
                    .map_err(|e| MeshError::MalformedSignal(format!("bad description: {e}")))?;

                let expected = if message.kind == SignalKind::Offer {
                    SdpType::Offer
                } else {
                    SdpType::Answer
                };
                if desc.sdp_type != expected {
                    return Err(MeshError::MalformedSignal(format!(
                        "{} payload carries {:?} description",
                        message.kind, desc.sdp_type
                    )));
                }
                if desc.sdp.trim().is_empty() {
                    return Err(MeshError::MalformedSignal("empty sdp".to_string()));
                }

                Ok(if expected == SdpType::Offer {
                    Signal::Offer(desc)
                } else {
                    Signal::Answer(desc)
                })
            }
            SignalKind::Candidate => {
                let candidate: IceCandidate = serde_json::from_value(inner.clone())
                    .map_err(|e| MeshError::MalformedSignal(format!("bad candidate: {e}")))?;
                Ok(Signal::Candidate(candidate))
            }
        }
    }
}

/// One relay record addressed from one participant to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub room_id: RoomId,
    pub from_peer_id: ParticipantId,
    pub to_peer_id: ParticipantId,
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl SignalingMessage {
    /// Build a message carrying `signal`, stamped now.
    ///
    /// # Errors
    ///
    /// Propagates payload encoding failures.
    pub fn new(
        room_id: RoomId,
        from_peer_id: ParticipantId,
        to_peer_id: ParticipantId,
        signal: &Signal,
    ) -> Result<Self, MeshError> {
        Ok(Self {
            room_id,
            from_peer_id,
            to_peer_id,
            kind: signal.kind(),
            payload: signal.to_payload()?,
            created_at: Utc::now(),
        })
    }
}
