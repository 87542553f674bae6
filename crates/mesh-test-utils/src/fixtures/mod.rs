//! Pre-configured test data fixtures for mesh testing.
//!
//! Provides:
//! - Rooms and participants
//! - Local track sets
//! - A configuration with short timers

use common::types::{ParticipantId, RoomId};
use mesh_client::media::{LocalTrack, TrackKind};
use mesh_client::presence::PresenceRecord;
use mesh_client::Config;
use std::time::Duration;
use uuid::Uuid;

/// Test room fixture.
#[derive(Debug, Clone)]
pub struct TestRoom {
    pub id: RoomId,
}

impl TestRoom {
    /// Create a test room with the given ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: RoomId::new(id),
        }
    }

    /// Create a test room with a random ID.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("room-{}", Uuid::new_v4()))
    }
}

impl Default for TestRoom {
    fn default() -> Self {
        Self::new("room-1")
    }
}

/// Test participant fixture.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    pub participant_id: ParticipantId,
    pub display_name: String,
}

impl TestParticipant {
    /// Participant whose display name is the upper-cased id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            display_name: id.to_uppercase(),
            participant_id: ParticipantId::new(id),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Active presence record for this participant in `room`.
    #[must_use]
    pub fn presence(&self, room: &TestRoom) -> PresenceRecord {
        PresenceRecord::joined(
            self.participant_id.clone(),
            room.id.clone(),
            self.display_name.clone(),
        )
    }
}

/// One enabled microphone and one enabled camera.
#[must_use]
pub fn camera_and_microphone() -> Vec<LocalTrack> {
    vec![
        LocalTrack::new("microphone", TrackKind::Audio),
        LocalTrack::new("camera", TrackKind::Video),
    ]
}

/// One enabled microphone.
#[must_use]
pub fn microphone_only() -> Vec<LocalTrack> {
    vec![LocalTrack::new("microphone", TrackKind::Audio)]
}

/// Configuration with timers short enough for real-clock tests and
/// round numbers for paused-clock tests.
#[must_use]
pub fn test_config() -> Config {
    Config {
        disconnect_grace: Duration::from_secs(5),
        negotiation_timeout: Duration::from_secs(10),
        presence_degraded_grace: Duration::from_secs(15),
        relay_send_timeout: Duration::from_secs(2),
        transport_op_timeout: Duration::from_secs(2),
        housekeeping_interval: Duration::from_millis(250),
        ..Config::default()
    }
}
