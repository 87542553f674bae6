//! Room presence.
//!
//! Presence records are owned by the relay; the mesh only reads remote
//! records and writes its own through the signaling client.

mod tracker;

pub use tracker::PresenceTracker;

use chrono::{DateTime, Utc};
use common::types::{ParticipantId, RoomId};
use serde::{Deserialize, Serialize};

/// One participant's membership record.
///
/// At most one active record exists per participant id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    #[serde(rename = "peer_id")]
    pub participant_id: ParticipantId,
    pub room_id: RoomId,
    pub display_name: String,
    #[serde(rename = "is_active")]
    pub active: bool,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub left_at: Option<DateTime<Utc>>,
}

impl PresenceRecord {
    /// Active record for a participant joining now.
    #[must_use]
    pub fn joined(
        participant_id: ParticipantId,
        room_id: RoomId,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            participant_id,
            room_id,
            display_name: display_name.into(),
            active: true,
            joined_at: Utc::now(),
            left_at: None,
        }
    }

    /// Inactive copy of this record stamped with a departure time.
    #[must_use]
    pub fn departed(&self) -> Self {
        Self {
            active: false,
            left_at: Some(Utc::now()),
            ..self.clone()
        }
    }
}

/// Membership change observed by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceEvent {
    /// A remote participant became active.
    Joined(PresenceRecord),
    /// A tracked remote participant went away.
    Left(ParticipantId),
    /// The presence feed failed; nothing more arrives until resubscribe.
    Degraded(String),
}

impl PresenceEvent {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            PresenceEvent::Joined(_) => "joined",
            PresenceEvent::Left(_) => "left",
            PresenceEvent::Degraded(_) => "degraded",
        }
    }
}
