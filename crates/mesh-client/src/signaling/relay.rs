//! The relay collaborator.
//!
//! A relay is a persisted, insertion-ordered message store scoped by room
//! that pushes inserts to subscribers. It also hosts the presence records
//! of the room. The mesh only needs the operations below; the backing
//! technology is the embedder's choice.

use crate::errors::MeshError;
use crate::presence::PresenceRecord;
use crate::signaling::message::SignalingMessage;
use async_trait::async_trait;
use common::types::{ParticipantId, RoomId};
use tokio::sync::mpsc;

/// Push feed of signaling messages. An `Err` item or a closed channel is a
/// subscription failure.
pub type SignalFeed = mpsc::Receiver<Result<SignalingMessage, MeshError>>;

/// Push feed of presence record upserts for one room.
pub type PresenceFeed = mpsc::Receiver<Result<PresenceRecord, MeshError>>;

/// Relay operations the mesh requires.
#[async_trait]
pub trait Relay: Send + Sync {
    /// Append a message, visible to subscribers of its recipient.
    async fn insert(&self, message: SignalingMessage) -> Result<(), MeshError>;

    /// Subscribe to messages inserted for `to` in `room_id`.
    async fn subscribe(&self, room_id: &RoomId, to: &ParticipantId)
        -> Result<SignalFeed, MeshError>;

    /// Point-in-time snapshot of active presence records in `room_id`.
    async fn query_active(&self, room_id: &RoomId) -> Result<Vec<PresenceRecord>, MeshError>;

    /// Insert or replace the presence record keyed by its participant id.
    async fn upsert_presence(&self, record: PresenceRecord) -> Result<(), MeshError>;

    /// Subscribe to presence record upserts in `room_id`.
    async fn subscribe_presence(&self, room_id: &RoomId) -> Result<PresenceFeed, MeshError>;
}
